//! Point mapping loader.
//!
//! Resolves the enabled measurement and control rows of one server into
//! ordered point lists for a backend. A duplicate `point_index` within one
//! kind is an integrity fault; the loader refuses to guess which row wins.

use std::collections::HashSet;
use std::sync::Arc;

use broker_model::{ControlType, MeasurementType, PointKind, ServerId, TenantId};
use tracing::debug;

use crate::store::{ConfigurationStore, PointKey};
use crate::{Error, Result};

/// A measurement point as exposed by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeasurementPoint {
    /// Protocol address.
    pub index: u16,
    /// Telemetry series backing the point.
    pub key: PointKey,
    /// Reported data type.
    pub point_type: MeasurementType,
}

/// A control point as exposed by a backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ControlPoint {
    /// Protocol address.
    pub index: u16,
    /// Node receiving the instruction.
    pub node_id: String,
    /// Source within the node.
    pub source_id: String,
    /// Optional property forwarded with the instruction.
    pub property: Option<String>,
    /// Accepted command type.
    pub point_type: ControlType,
}

/// Ordered point lists for one server.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PointMap {
    /// Measurements sorted by index.
    pub measurements: Vec<MeasurementPoint>,
    /// Controls sorted by index.
    pub controls: Vec<ControlPoint>,
}

impl PointMap {
    /// Look up a control point by index.
    #[must_use]
    pub fn control(&self, index: u16) -> Option<&ControlPoint> {
        self.controls
            .binary_search_by_key(&index, |c| c.index)
            .ok()
            .map(|i| &self.controls[i])
    }
}

/// Loads point mappings from the configuration store.
#[derive(Clone)]
pub struct PointMappingLoader {
    store: Arc<dyn ConfigurationStore>,
}

impl PointMappingLoader {
    /// Create a loader over the given configuration store.
    pub fn new(store: Arc<dyn ConfigurationStore>) -> Self {
        Self { store }
    }

    /// Enabled measurements of a server, sorted by index.
    ///
    /// # Errors
    ///
    /// `Error::ConfigurationInconsistency` on a duplicate enabled index;
    /// store failures are propagated.
    pub async fn load_measurements(
        &self,
        tenant: &TenantId,
        server: &ServerId,
    ) -> Result<Vec<MeasurementPoint>> {
        let mut points: Vec<MeasurementPoint> = self
            .store
            .measurements(tenant, server)
            .await?
            .into_iter()
            .filter(|row| row.enabled)
            .map(|row| MeasurementPoint {
                index: row.point_index,
                key: PointKey::new(row.node_id, row.source_id, row.property),
                point_type: row.point_type,
            })
            .collect();
        points.sort_by_key(|p| p.index);
        ensure_unique(points.iter().map(|p| p.index), PointKind::Measurement, tenant, server)?;
        Ok(points)
    }

    /// Enabled controls of a server, sorted by index.
    ///
    /// # Errors
    ///
    /// `Error::ConfigurationInconsistency` on a duplicate enabled index;
    /// store failures are propagated.
    pub async fn load_controls(
        &self,
        tenant: &TenantId,
        server: &ServerId,
    ) -> Result<Vec<ControlPoint>> {
        let mut points: Vec<ControlPoint> = self
            .store
            .controls(tenant, server)
            .await?
            .into_iter()
            .filter(|row| row.enabled)
            .map(|row| ControlPoint {
                index: row.point_index,
                node_id: row.node_id,
                source_id: row.source_id,
                property: row.property,
                point_type: row.point_type,
            })
            .collect();
        points.sort_by_key(|p| p.index);
        ensure_unique(points.iter().map(|p| p.index), PointKind::Control, tenant, server)?;
        Ok(points)
    }

    /// Both lists for a server.
    ///
    /// # Errors
    ///
    /// See [`Self::load_measurements`] and [`Self::load_controls`].
    pub async fn load(&self, tenant: &TenantId, server: &ServerId) -> Result<PointMap> {
        let measurements = self.load_measurements(tenant, server).await?;
        let controls = self.load_controls(tenant, server).await?;
        debug!(
            tenant = %tenant,
            server = %server,
            measurements = measurements.len(),
            controls = controls.len(),
            "Point mappings loaded"
        );
        Ok(PointMap {
            measurements,
            controls,
        })
    }
}

fn ensure_unique(
    indices: impl Iterator<Item = u16>,
    kind: PointKind,
    tenant: &TenantId,
    server: &ServerId,
) -> Result<()> {
    let mut seen = HashSet::new();
    for index in indices {
        if !seen.insert(index) {
            return Err(Error::ConfigurationInconsistency(format!(
                "Duplicate {kind} point index {index} for {tenant}/{server}"
            )));
        }
    }
    Ok(())
}
