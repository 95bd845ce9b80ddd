//! Tenant configuration rows consumed by the outstation broker.
//!
//! These rows are owned by the platform's configuration service; the broker
//! only ever reads them. Every row carries an `enabled` flag and consumers are
//! expected to ignore disabled rows rather than the store filtering them out.

use std::fmt;

use serde::{Deserialize, Serialize};

// ─────────────────────────────────────────────────────────────────────────────
// Identifiers
// ─────────────────────────────────────────────────────────────────────────────

/// Account namespace owning a server's configuration.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TenantId(pub String);

/// Logical server (one outstation) within a tenant.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ServerId(pub String);

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for ServerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TenantId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

impl From<&str> for ServerId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Authorization and trust rows
// ─────────────────────────────────────────────────────────────────────────────

/// Binds a client certificate identifier to a tenant's server.
///
/// `client_identifier` is a subject distinguished name. Among enabled rows it
/// is unique platform-wide, because lookups happen before the tenant is known.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerAuthConfiguration {
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Server the certificate is allowed to reach.
    pub server_id: ServerId,
    /// Subject DN of the client certificate.
    pub client_identifier: String,
    /// Disabled rows never authorize anything.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// A CA certificate trusted for one tenant's client connections.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrustedIssuerCertificate {
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// PEM-encoded CA certificate.
    pub ca_certificate: String,
    /// Disabled rows contribute no trust.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Point rows
// ─────────────────────────────────────────────────────────────────────────────

/// Which point table a row belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PointKind {
    /// Values read by the master station.
    Measurement,
    /// Commands issued by the master station.
    Control,
}

impl fmt::Display for PointKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Measurement => f.write_str("measurement"),
            Self::Control => f.write_str("control"),
        }
    }
}

/// Data type reported for a measurement point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum MeasurementType {
    /// Floating point value.
    #[serde(alias = "analog_input")]
    AnalogInput,
    /// On/off state; any non-zero telemetry value reads as `true`.
    #[serde(alias = "binary_input")]
    BinaryInput,
    /// Monotonic non-negative counter.
    #[serde(alias = "counter")]
    Counter,
}

/// Data type accepted by a control point.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ControlType {
    /// On/off command.
    #[serde(alias = "binary")]
    Binary,
    /// Setpoint command.
    #[serde(alias = "analog")]
    Analog,
}

/// Maps one measurement point index to a telemetry series.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerMeasurementConfiguration {
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Owning server.
    pub server_id: ServerId,
    /// Protocol address of the point.
    pub point_index: u16,
    /// Platform node the series belongs to.
    pub node_id: String,
    /// Source within the node (e.g. `meter/1`).
    pub source_id: String,
    /// Telemetry property (e.g. `watts`).
    pub property: String,
    /// Reported data type.
    #[serde(rename = "type")]
    pub point_type: MeasurementType,
    /// Disabled rows are not exposed.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

/// Maps one control point index to an instruction target.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServerControlConfiguration {
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Owning server.
    pub server_id: ServerId,
    /// Protocol address of the point.
    pub point_index: u16,
    /// Platform node receiving the instruction.
    pub node_id: String,
    /// Source within the node (e.g. `switch/1`).
    pub source_id: String,
    /// Optional property name forwarded with the instruction.
    #[serde(default)]
    pub property: Option<String>,
    /// Accepted command type.
    #[serde(rename = "type")]
    pub point_type: ControlType,
    /// Disabled rows are not exposed.
    #[serde(default = "default_enabled")]
    pub enabled: bool,
}

// ─────────────────────────────────────────────────────────────────────────────
// Document
// ─────────────────────────────────────────────────────────────────────────────

/// All configuration rows, as exported by the configuration service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TenantConfiguration {
    /// Certificate → server bindings.
    pub auth: Vec<ServerAuthConfiguration>,
    /// Trusted CAs per tenant.
    pub trusted_issuers: Vec<TrustedIssuerCertificate>,
    /// Measurement point mappings.
    pub measurements: Vec<ServerMeasurementConfiguration>,
    /// Control point mappings.
    pub controls: Vec<ServerControlConfiguration>,
}

fn default_enabled() -> bool {
    true
}
