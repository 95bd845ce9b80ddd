//! Request handling against the telemetry store and instruction queue.

use std::sync::Arc;

use broker_model::{ControlType, MeasurementType};
use chrono::Utc;
use serde_json::json;
use tracing::{debug, warn};

use super::protocol::{AckStatus, ControlValue, PointReport, PointValue, Request, Response};
use crate::points::{ControlPoint, PointMap};
use crate::store::{Instruction, InstructionQueue, Reading, TelemetryStore};

/// Answers scan and operate requests for one backend.
pub struct RequestHandler {
    points: PointMap,
    telemetry: Arc<dyn TelemetryStore>,
    instructions: Arc<dyn InstructionQueue>,
    topic: String,
}

impl RequestHandler {
    /// Create a handler for one backend's points.
    pub fn new(
        points: PointMap,
        telemetry: Arc<dyn TelemetryStore>,
        instructions: Arc<dyn InstructionQueue>,
        topic: impl Into<String>,
    ) -> Self {
        Self {
            points,
            telemetry,
            instructions,
            topic: topic.into(),
        }
    }

    /// Dispatch one parsed request.
    pub async fn handle(&self, request: Request) -> Response {
        match request {
            Request::Scan => Response::Scan {
                points: self.scan().await,
            },
            Request::Operate { index, value } => Response::Ack {
                index,
                status: self.operate(index, value).await,
            },
        }
    }

    /// Report the most recent value of every measurement point.
    ///
    /// A failed or empty lookup marks only that point unavailable.
    pub async fn scan(&self) -> Vec<PointReport> {
        let now = Utc::now();
        let mut reports = Vec::with_capacity(self.points.measurements.len());

        for point in &self.points.measurements {
            let value = match self.telemetry.latest(&point.key, now).await {
                Ok(Some(reading)) => convert(point.point_type, &reading),
                Ok(None) => PointValue::Unavailable,
                Err(e) => {
                    warn!(index = point.index, error = %e, "Telemetry lookup failed");
                    PointValue::Unavailable
                }
            };
            reports.push(PointReport {
                index: point.index,
                value,
            });
        }

        telemetry_metrics::counter!("outstation_scans_total").increment(1);
        reports
    }

    /// Queue one instruction for the control at `index`. Never retries.
    pub async fn operate(&self, index: u16, value: ControlValue) -> AckStatus {
        let status = match self.points.control(index) {
            None => AckStatus::NotSupported,
            Some(control) => match self.instruction_for(control, value) {
                None => AckStatus::FormatError,
                Some(instruction) => match self.instructions.enqueue(instruction).await {
                    Ok(()) => AckStatus::Success,
                    Err(e) => {
                        warn!(index, error = %e, "Instruction rejected");
                        AckStatus::Failed
                    }
                },
            },
        };

        debug!(index, status = status.as_str(), "Operate handled");
        telemetry_metrics::counter!("outstation_instructions_total", "status" => status.as_str())
            .increment(1);
        status
    }

    fn instruction_for(&self, control: &ControlPoint, value: ControlValue) -> Option<Instruction> {
        let value = match (control.point_type, value) {
            (ControlType::Binary, ControlValue::Binary(on)) => json!(on),
            (ControlType::Analog, ControlValue::Analog(v)) if v.is_finite() => json!(v),
            _ => return None,
        };

        let mut parameters = json!({
            "source_id": control.source_id,
            "value": value,
            "point_index": control.index,
        });
        if let (Some(property), Some(map)) = (&control.property, parameters.as_object_mut()) {
            map.insert("property".to_string(), json!(property));
        }

        Some(Instruction {
            topic: self.topic.clone(),
            node_id: control.node_id.clone(),
            parameters,
        })
    }
}

#[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
fn convert(point_type: MeasurementType, reading: &Reading) -> PointValue {
    let v = reading.value;
    if !v.is_finite() {
        return PointValue::Unavailable;
    }
    match point_type {
        MeasurementType::AnalogInput => PointValue::Analog(v),
        MeasurementType::BinaryInput => PointValue::Binary(v != 0.0),
        MeasurementType::Counter if v >= 0.0 => PointValue::Counter(v as u64),
        MeasurementType::Counter => PointValue::Unavailable,
    }
}
