//! Line-delimited JSON messages spoken by the outstation.
//!
//! One request per line in, one response per line out:
//!
//! ```text
//! → {"op":"scan"}
//! ← {"type":"scan","points":[{"index":0,"value":{"analog":464.0}},{"index":1,"value":"unavailable"}]}
//! → {"op":"operate","index":0,"value":true}
//! ← {"type":"ack","index":0,"status":"success"}
//! ```

use serde::{Deserialize, Serialize};

use crate::Result;

/// A master-station request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// Read every measurement point.
    Scan,
    /// Command one control point.
    Operate {
        /// Control point index.
        index: u16,
        /// Commanded value.
        value: ControlValue,
    },
}

/// Value carried by an operate request.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ControlValue {
    /// On/off command.
    Binary(bool),
    /// Setpoint.
    Analog(f64),
}

/// Reported value of one measurement point.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PointValue {
    /// Analog input value.
    Analog(f64),
    /// Binary input state.
    Binary(bool),
    /// Counter value.
    Counter(u64),
    /// No usable reading for this scan.
    Unavailable,
}

/// One entry of a scan response.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct PointReport {
    /// Measurement point index.
    pub index: u16,
    /// Value for this scan.
    pub value: PointValue,
}

/// Outcome of an operate request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AckStatus {
    /// Instruction queued.
    Success,
    /// No control point at that index.
    NotSupported,
    /// Value type does not match the control type.
    FormatError,
    /// Instruction could not be queued.
    Failed,
}

impl AckStatus {
    /// Metric label.
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Success => "success",
            Self::NotSupported => "not_supported",
            Self::FormatError => "format_error",
            Self::Failed => "failed",
        }
    }
}

/// An outstation response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
#[allow(missing_docs)]
pub enum Response {
    /// Answer to [`Request::Scan`], in point index order.
    Scan { points: Vec<PointReport> },
    /// Answer to [`Request::Operate`].
    Ack { index: u16, status: AckStatus },
    /// The request line could not be handled.
    Error { message: String },
}

impl Response {
    /// Serialize as a single line (without the terminator).
    ///
    /// # Errors
    ///
    /// Returns `Error::Json` if serialization fails.
    pub fn to_line(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }
}

/// Parse one request line.
///
/// # Errors
///
/// Returns `Error::Json` for anything that is not a known request.
pub fn parse_request(line: &str) -> Result<Request> {
    Ok(serde_json::from_str(line.trim())?)
}
