//! Collaborator stores — configuration, telemetry, and instruction queue.
//!
//! The broker core only talks to these through traits. The in-memory
//! implementations here back the shipped binary and the test suite; a
//! production deployment swaps in database- or bus-backed implementations.
//!
//! # Design
//!
//! The configuration store is deliberately dumb: it returns every row for a
//! key, enabled or not, and the consuming component applies the `enabled`
//! filter and integrity checks. That keeps fail-closed logic in one place.

use std::collections::{HashMap, VecDeque};
use std::path::Path;

use broker_model::{
    ServerAuthConfiguration, ServerControlConfiguration, ServerId,
    ServerMeasurementConfiguration, TenantConfiguration, TenantId, TrustedIssuerCertificate,
};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::identity::canonicalize_dn;
use crate::{Error, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Configuration store
// ─────────────────────────────────────────────────────────────────────────────

/// Read-only tenant configuration lookups.
///
/// Implementations must be `Send + Sync` because one store is shared by all
/// concurrent authorizations.
#[async_trait::async_trait]
pub trait ConfigurationStore: Send + Sync + 'static {
    /// All auth rows whose identifier canonicalises to `identifier`.
    async fn auth_configurations(&self, identifier: &str)
    -> Result<Vec<ServerAuthConfiguration>>;

    /// All trusted-issuer rows for a tenant.
    async fn trusted_issuers(&self, tenant: &TenantId) -> Result<Vec<TrustedIssuerCertificate>>;

    /// All measurement rows for a server.
    async fn measurements(
        &self,
        tenant: &TenantId,
        server: &ServerId,
    ) -> Result<Vec<ServerMeasurementConfiguration>>;

    /// All control rows for a server.
    async fn controls(
        &self,
        tenant: &TenantId,
        server: &ServerId,
    ) -> Result<Vec<ServerControlConfiguration>>;
}

/// Configuration store over an in-memory [`TenantConfiguration`] snapshot.
///
/// Auth rows are indexed by canonical identifier so that lookups are O(1)
/// regardless of how the DN was spelled in the source document.
#[derive(Debug, Default)]
pub struct InMemoryConfigurationStore {
    document: TenantConfiguration,
    auth_by_identifier: HashMap<String, Vec<ServerAuthConfiguration>>,
}

impl InMemoryConfigurationStore {
    /// Index a configuration document.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if an auth row's identifier is not a valid DN.
    pub fn new(document: TenantConfiguration) -> Result<Self> {
        let mut auth_by_identifier: HashMap<String, Vec<ServerAuthConfiguration>> =
            HashMap::new();
        for row in &document.auth {
            let key = canonicalize_dn(&row.client_identifier).map_err(|e| {
                Error::Config(format!(
                    "Invalid client identifier '{}' for {}/{}: {e}",
                    row.client_identifier, row.tenant_id, row.server_id
                ))
            })?;
            auth_by_identifier.entry(key).or_default().push(row.clone());
        }

        debug!(
            auth = document.auth.len(),
            trusted_issuers = document.trusted_issuers.len(),
            measurements = document.measurements.len(),
            controls = document.controls.len(),
            "Configuration store indexed"
        );

        Ok(Self {
            document,
            auth_by_identifier,
        })
    }

    /// Load a YAML configuration document from disk.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the file cannot be read or parsed.
    pub fn from_yaml_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Cannot read tenant configuration '{}': {e}", path.display()))
        })?;
        Self::from_yaml_str(&raw)
    }

    /// Parse a YAML configuration document.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the YAML is malformed.
    pub fn from_yaml_str(raw: &str) -> Result<Self> {
        let document: TenantConfiguration = serde_yaml::from_str(raw)
            .map_err(|e| Error::Config(format!("Invalid tenant configuration: {e}")))?;
        Self::new(document)
    }

    /// The underlying document.
    #[must_use]
    pub fn document(&self) -> &TenantConfiguration {
        &self.document
    }
}

#[async_trait::async_trait]
impl ConfigurationStore for InMemoryConfigurationStore {
    async fn auth_configurations(
        &self,
        identifier: &str,
    ) -> Result<Vec<ServerAuthConfiguration>> {
        Ok(self
            .auth_by_identifier
            .get(identifier)
            .cloned()
            .unwrap_or_default())
    }

    async fn trusted_issuers(&self, tenant: &TenantId) -> Result<Vec<TrustedIssuerCertificate>> {
        Ok(self
            .document
            .trusted_issuers
            .iter()
            .filter(|row| &row.tenant_id == tenant)
            .cloned()
            .collect())
    }

    async fn measurements(
        &self,
        tenant: &TenantId,
        server: &ServerId,
    ) -> Result<Vec<ServerMeasurementConfiguration>> {
        Ok(self
            .document
            .measurements
            .iter()
            .filter(|row| &row.tenant_id == tenant && &row.server_id == server)
            .cloned()
            .collect())
    }

    async fn controls(
        &self,
        tenant: &TenantId,
        server: &ServerId,
    ) -> Result<Vec<ServerControlConfiguration>> {
        Ok(self
            .document
            .controls
            .iter()
            .filter(|row| &row.tenant_id == tenant && &row.server_id == server)
            .cloned()
            .collect())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Telemetry store
// ─────────────────────────────────────────────────────────────────────────────

/// Identifies one telemetry series.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct PointKey {
    /// Platform node.
    pub node_id: String,
    /// Source within the node.
    pub source_id: String,
    /// Measured property.
    pub property: String,
}

impl PointKey {
    /// Build a key from its parts.
    pub fn new(
        node_id: impl Into<String>,
        source_id: impl Into<String>,
        property: impl Into<String>,
    ) -> Self {
        Self {
            node_id: node_id.into(),
            source_id: source_id.into(),
            property: property.into(),
        }
    }
}

/// One timestamped telemetry sample.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Reading {
    /// When the value was measured.
    pub timestamp: DateTime<Utc>,
    /// Measured value.
    pub value: f64,
}

/// Source of the most recent telemetry values.
#[async_trait::async_trait]
pub trait TelemetryStore: Send + Sync + 'static {
    /// Most recent reading for `key` with `timestamp <= as_of`.
    ///
    /// Returns `Ok(None)` when no such reading exists.
    async fn latest(&self, key: &PointKey, as_of: DateTime<Utc>) -> Result<Option<Reading>>;
}

/// Samples retained per series by [`InMemoryTelemetryStore`].
const MAX_SAMPLES_PER_SERIES: usize = 256;

/// Telemetry store keeping a short, time-ordered history per series.
#[derive(Debug, Default)]
pub struct InMemoryTelemetryStore {
    series: DashMap<PointKey, Vec<Reading>>,
}

/// One reading in a telemetry seed file.
#[derive(Debug, Clone, Deserialize)]
struct SeedReading {
    node_id: String,
    source_id: String,
    property: String,
    value: f64,
    #[serde(default)]
    timestamp: Option<DateTime<Utc>>,
}

impl InMemoryTelemetryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a reading, keeping the series ordered by timestamp.
    pub fn record(&self, key: PointKey, reading: Reading) {
        let mut samples = self.series.entry(key).or_default();
        let pos = samples.partition_point(|r| r.timestamp <= reading.timestamp);
        samples.insert(pos, reading);
        if samples.len() > MAX_SAMPLES_PER_SERIES {
            let excess = samples.len() - MAX_SAMPLES_PER_SERIES;
            samples.drain(..excess);
        }
    }

    /// Seed the store from a YAML list of readings.
    ///
    /// Readings without a timestamp are stamped with the load time.
    ///
    /// # Errors
    ///
    /// Returns `Error::Config` if the file cannot be read or parsed.
    pub fn load_seed(&self, path: &Path) -> Result<usize> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            Error::Config(format!("Cannot read telemetry seed '{}': {e}", path.display()))
        })?;
        let seed: Vec<SeedReading> = serde_yaml::from_str(&raw)
            .map_err(|e| Error::Config(format!("Invalid telemetry seed: {e}")))?;
        let now = Utc::now();
        let count = seed.len();
        for s in seed {
            self.record(
                PointKey::new(s.node_id, s.source_id, s.property),
                Reading {
                    timestamp: s.timestamp.unwrap_or(now),
                    value: s.value,
                },
            );
        }
        Ok(count)
    }
}

#[async_trait::async_trait]
impl TelemetryStore for InMemoryTelemetryStore {
    async fn latest(&self, key: &PointKey, as_of: DateTime<Utc>) -> Result<Option<Reading>> {
        let Some(samples) = self.series.get(key) else {
            return Ok(None);
        };
        let pos = samples.partition_point(|r| r.timestamp <= as_of);
        Ok(pos.checked_sub(1).map(|i| samples[i]))
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Instruction queue
// ─────────────────────────────────────────────────────────────────────────────

/// A command destined for a platform node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Instruction {
    /// Queue topic.
    pub topic: String,
    /// Target node.
    pub node_id: String,
    /// Instruction payload.
    pub parameters: serde_json::Value,
}

/// Sink for outbound instructions. Retry policy belongs to the implementation.
#[async_trait::async_trait]
pub trait InstructionQueue: Send + Sync + 'static {
    /// Enqueue one instruction.
    async fn enqueue(&self, instruction: Instruction) -> Result<()>;
}

/// Bounded FIFO instruction queue.
#[derive(Debug)]
pub struct InMemoryInstructionQueue {
    capacity: usize,
    pending: Mutex<VecDeque<Instruction>>,
}

impl InMemoryInstructionQueue {
    /// Create a queue holding at most `capacity` instructions.
    #[must_use]
    pub fn new(capacity: usize) -> Self {
        Self {
            capacity,
            pending: Mutex::new(VecDeque::new()),
        }
    }

    /// Remove and return everything queued so far.
    pub fn drain(&self) -> Vec<Instruction> {
        self.pending.lock().drain(..).collect()
    }

    /// Number of queued instructions.
    #[must_use]
    pub fn len(&self) -> usize {
        self.pending.lock().len()
    }

    /// `true` when nothing is queued.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.pending.lock().is_empty()
    }
}

#[async_trait::async_trait]
impl InstructionQueue for InMemoryInstructionQueue {
    async fn enqueue(&self, instruction: Instruction) -> Result<()> {
        let mut pending = self.pending.lock();
        if pending.len() >= self.capacity {
            return Err(Error::Store(format!(
                "Instruction queue full ({} pending)",
                self.capacity
            )));
        }
        pending.push_back(instruction);
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;

    const DOC: &str = r#"
auth:
  - tenant_id: acme
    server_id: s1
    client_identifier: "CN=Test Client, O=Test Org"
  - tenant_id: acme
    server_id: s2
    client_identifier: "CN=Other"
    enabled: false
trusted_issuers:
  - tenant_id: acme
    ca_certificate: "pem"
  - tenant_id: globex
    ca_certificate: "pem"
measurements:
  - tenant_id: acme
    server_id: s1
    point_index: 0
    node_id: n1
    source_id: meter/1
    property: watts
    type: AnalogInput
controls:
  - tenant_id: acme
    server_id: s1
    point_index: 0
    node_id: n1
    source_id: switch/1
    type: Binary
"#;

    // ── configuration store ──────────────────────────────────────────────────

    #[tokio::test]
    async fn auth_lookup_uses_canonical_identifier() {
        let store = InMemoryConfigurationStore::from_yaml_str(DOC).unwrap();
        let rows = store
            .auth_configurations("CN=test client,O=test org")
            .await
            .unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].server_id, ServerId::from("s1"));
    }

    #[tokio::test]
    async fn auth_lookup_returns_disabled_rows_too() {
        let store = InMemoryConfigurationStore::from_yaml_str(DOC).unwrap();
        let rows = store.auth_configurations("CN=other").await.unwrap();
        assert_eq!(rows.len(), 1);
        assert!(!rows[0].enabled);
    }

    #[tokio::test]
    async fn unknown_identifier_yields_no_rows() {
        let store = InMemoryConfigurationStore::from_yaml_str(DOC).unwrap();
        assert!(store.auth_configurations("CN=nobody").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn issuers_are_scoped_to_tenant() {
        let store = InMemoryConfigurationStore::from_yaml_str(DOC).unwrap();
        let rows = store.trusted_issuers(&TenantId::from("acme")).await.unwrap();
        assert_eq!(rows.len(), 1);
        let none = store.trusted_issuers(&TenantId::from("initech")).await.unwrap();
        assert!(none.is_empty());
    }

    #[tokio::test]
    async fn points_are_scoped_to_server() {
        let store = InMemoryConfigurationStore::from_yaml_str(DOC).unwrap();
        let tenant = TenantId::from("acme");
        assert_eq!(
            store.measurements(&tenant, &ServerId::from("s1")).await.unwrap().len(),
            1
        );
        assert!(
            store
                .controls(&tenant, &ServerId::from("s2"))
                .await
                .unwrap()
                .is_empty()
        );
    }

    #[test]
    fn invalid_identifier_is_a_config_error() {
        let doc = "auth:\n  - tenant_id: a\n    server_id: b\n    client_identifier: nonsense";
        assert!(matches!(
            InMemoryConfigurationStore::from_yaml_str(doc),
            Err(Error::Config(_))
        ));
    }

    #[test]
    fn missing_file_is_a_config_error() {
        let result = InMemoryConfigurationStore::from_yaml_file(Path::new("/nonexistent/x.yaml"));
        assert!(matches!(result, Err(Error::Config(_))));
    }

    // ── telemetry store ──────────────────────────────────────────────────────

    #[tokio::test]
    async fn latest_is_none_before_any_reading() {
        let store = InMemoryTelemetryStore::new();
        let key = PointKey::new("n1", "meter/1", "watts");
        assert!(store.latest(&key, Utc::now()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn latest_respects_as_of() {
        // GIVEN: 464 at T and 500 at T+10s
        let store = InMemoryTelemetryStore::new();
        let key = PointKey::new("n1", "meter/1", "watts");
        let t = Utc::now();
        store.record(key.clone(), Reading { timestamp: t, value: 464.0 });
        store.record(
            key.clone(),
            Reading { timestamp: t + Duration::seconds(10), value: 500.0 },
        );
        // THEN: query before T sees nothing, at T sees 464, later sees 500
        assert!(store.latest(&key, t - Duration::seconds(1)).await.unwrap().is_none());
        assert_eq!(store.latest(&key, t).await.unwrap().unwrap().value, 464.0);
        assert_eq!(
            store
                .latest(&key, t + Duration::seconds(60))
                .await
                .unwrap()
                .unwrap()
                .value,
            500.0
        );
    }

    #[tokio::test]
    async fn out_of_order_records_are_sorted() {
        let store = InMemoryTelemetryStore::new();
        let key = PointKey::new("n1", "meter/1", "watts");
        let t = Utc::now();
        store.record(key.clone(), Reading { timestamp: t, value: 2.0 });
        store.record(
            key.clone(),
            Reading { timestamp: t - Duration::seconds(5), value: 1.0 },
        );
        assert_eq!(store.latest(&key, t).await.unwrap().unwrap().value, 2.0);
    }

    #[test]
    fn series_history_is_bounded() {
        let store = InMemoryTelemetryStore::new();
        let key = PointKey::new("n1", "meter/1", "watts");
        let t = Utc::now();
        for i in 0..(MAX_SAMPLES_PER_SERIES + 10) {
            let offset = i64::try_from(i).unwrap();
            store.record(
                key.clone(),
                Reading { timestamp: t + Duration::seconds(offset), value: 0.0 },
            );
        }
        assert_eq!(store.series.get(&key).unwrap().len(), MAX_SAMPLES_PER_SERIES);
    }

    #[tokio::test]
    async fn seed_file_populates_store() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("seed.yaml");
        std::fs::write(
            &path,
            "- node_id: n1\n  source_id: meter/1\n  property: watts\n  value: 12.5\n",
        )
        .unwrap();
        let store = InMemoryTelemetryStore::new();
        assert_eq!(store.load_seed(&path).unwrap(), 1);
        let key = PointKey::new("n1", "meter/1", "watts");
        let reading = store.latest(&key, Utc::now()).await.unwrap().unwrap();
        assert_eq!(reading.value, 12.5);
    }

    // ── instruction queue ────────────────────────────────────────────────────

    fn instruction(node: &str) -> Instruction {
        Instruction {
            topic: "outstation/operate".to_string(),
            node_id: node.to_string(),
            parameters: serde_json::json!({ "value": true }),
        }
    }

    #[tokio::test]
    async fn queue_preserves_order_and_drains() {
        let queue = InMemoryInstructionQueue::new(4);
        queue.enqueue(instruction("a")).await.unwrap();
        queue.enqueue(instruction("b")).await.unwrap();
        assert_eq!(queue.len(), 2);
        let drained = queue.drain();
        assert_eq!(drained[0].node_id, "a");
        assert_eq!(drained[1].node_id, "b");
        assert!(queue.is_empty());
    }

    #[tokio::test]
    async fn full_queue_rejects() {
        let queue = InMemoryInstructionQueue::new(1);
        queue.enqueue(instruction("a")).await.unwrap();
        let err = queue.enqueue(instruction("b")).await.unwrap_err();
        assert!(matches!(err, Error::Store(_)));
        assert_eq!(queue.len(), 1);
    }
}
