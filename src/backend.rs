//! Backend capability traits and the live-backend registry.
//!
//! A backend is a per-connection protocol responder bound to one reserved
//! port. The broker is generic over [`BackendProvisioner`], so the shipped
//! outstation can be swapped for a different responder (or a test double)
//! without touching the authorization flow.

use std::fmt;
use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use broker_model::{ServerId, TenantId};
use dashmap::DashMap;
use tracing::{debug, info, warn};

use crate::Result;
use crate::points::PointMap;
use crate::ports::PortAllocator;

// ─────────────────────────────────────────────────────────────────────────────
// State machine
// ─────────────────────────────────────────────────────────────────────────────

/// Lifecycle state of a backend.
///
/// `Provisioned → Enabled → Stopped`; `Stopped` is reachable from any state
/// and is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum BackendState {
    /// Socket bound, protocol traffic not yet answered.
    Provisioned,
    /// Answering protocol traffic.
    Enabled,
    /// Sockets released.
    Stopped,
}

impl fmt::Display for BackendState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Provisioned => write!(f, "provisioned"),
            Self::Enabled => write!(f, "enabled"),
            Self::Stopped => write!(f, "stopped"),
        }
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Capability traits
// ─────────────────────────────────────────────────────────────────────────────

/// Everything a provisioner needs to start one backend.
#[derive(Debug, Clone)]
pub struct BackendSpec {
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Server the backend impersonates.
    pub server_id: ServerId,
    /// Reserved port to bind.
    pub port: u16,
    /// Points to expose.
    pub points: PointMap,
}

/// Creates backends in the `Provisioned` state.
#[async_trait]
pub trait BackendProvisioner: Send + Sync + 'static {
    /// Handle type returned by [`Self::start`].
    type Handle: BackendHandle;

    /// Bind the backend's socket on `spec.port` without answering traffic.
    ///
    /// # Errors
    ///
    /// `Error::ProvisioningFailure` if the backend cannot be started.
    async fn start(&self, spec: BackendSpec) -> Result<Self::Handle>;
}

/// Control surface of a running backend.
#[async_trait]
pub trait BackendHandle: Send + Sync + 'static {
    /// Current state.
    fn state(&self) -> BackendState;

    /// Address the backend listens on.
    fn local_addr(&self) -> SocketAddr;

    /// Transition `Provisioned → Enabled`.
    ///
    /// # Errors
    ///
    /// `Error::InvalidState` from any other state.
    fn enable(&self) -> Result<()>;

    /// Transition to `Stopped` and wait until the backend's sockets are
    /// closed. Idempotent and valid from any state.
    async fn stop(&self);
}

// ─────────────────────────────────────────────────────────────────────────────
// Lease
// ─────────────────────────────────────────────────────────────────────────────

/// One backend together with the port it holds.
///
/// Whoever stops the lease first stops the backend and then releases the
/// port; every later stop is a no-op. A port is therefore released exactly
/// once, and only by the connection that reserved it.
pub struct BackendLease<H: BackendHandle> {
    port: u16,
    backend: Arc<H>,
    ports: Arc<dyn PortAllocator>,
    stopped: AtomicBool,
}

impl<H: BackendHandle> BackendLease<H> {
    /// Take ownership of `port` (already reserved from `ports`) for `backend`.
    #[must_use]
    pub fn new(port: u16, backend: Arc<H>, ports: Arc<dyn PortAllocator>) -> Self {
        Self {
            port,
            backend,
            ports,
            stopped: AtomicBool::new(false),
        }
    }

    /// Port held by the backend.
    #[must_use]
    pub fn port(&self) -> u16 {
        self.port
    }

    /// The leased backend.
    #[must_use]
    pub fn backend(&self) -> &Arc<H> {
        &self.backend
    }

    /// `true` once a stop has been claimed.
    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    /// Stop the backend, then release the port.
    ///
    /// Returns `false` without waiting if another caller already claimed the
    /// stop; that caller releases the port once the backend is down.
    pub async fn stop(&self) -> bool {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return false;
        }
        self.backend.stop().await;
        self.ports.release(self.port);
        true
    }

    /// Claim the stop and finish it on the current runtime.
    ///
    /// Without a runtime the port is released immediately; the backend shuts
    /// down when its last handle is dropped.
    pub fn stop_detached(self: &Arc<Self>) -> bool {
        if self.stopped.swap(true, Ordering::AcqRel) {
            return false;
        }
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                let lease = Arc::clone(self);
                runtime.spawn(async move {
                    lease.backend.stop().await;
                    lease.ports.release(lease.port);
                    debug!(port = lease.port, "Detached stop finished");
                });
            }
            Err(_) => {
                warn!(port = self.port, "No runtime to stop backend, releasing port");
                self.ports.release(self.port);
            }
        }
        true
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Registry
// ─────────────────────────────────────────────────────────────────────────────

/// Live backend leases keyed by the port they hold.
pub struct BackendRegistry<H: BackendHandle> {
    leases: DashMap<u16, Arc<BackendLease<H>>>,
}

impl<H: BackendHandle> BackendRegistry<H> {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self {
            leases: DashMap::new(),
        }
    }

    /// Track a lease under its port, returning any lease previously
    /// registered there.
    pub fn register(&self, lease: Arc<BackendLease<H>>) -> Option<Arc<BackendLease<H>>> {
        let port = lease.port();
        debug!(port, "Backend registered");
        self.leases.insert(port, lease)
    }

    /// Stop tracking `lease`. An entry for the same port that belongs to a
    /// different lease is left alone.
    pub fn remove(&self, lease: &Arc<BackendLease<H>>) -> bool {
        self.leases
            .remove_if(&lease.port(), |_, current| Arc::ptr_eq(current, lease))
            .is_some()
    }

    /// Lease on `port`, if any.
    #[must_use]
    pub fn get(&self, port: u16) -> Option<Arc<BackendLease<H>>> {
        self.leases.get(&port).map(|l| Arc::clone(&*l))
    }

    /// Number of live backends.
    #[must_use]
    pub fn len(&self) -> usize {
        self.leases.len()
    }

    /// `true` if no backend is live.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.leases.is_empty()
    }

    /// Ports currently held by live backends, sorted.
    #[must_use]
    pub fn ports(&self) -> Vec<u16> {
        let mut ports: Vec<u16> = self.leases.iter().map(|e| *e.key()).collect();
        ports.sort_unstable();
        ports
    }

    /// Stop and forget every backend.
    ///
    /// Returns the ports this call stopped and released. Leases already
    /// being stopped elsewhere are untracked but left to that caller.
    pub async fn shutdown_all(&self) -> Vec<u16> {
        let mut stopped = Vec::new();
        for port in self.ports() {
            if let Some((_, lease)) = self.leases.remove(&port) {
                if lease.stop().await {
                    stopped.push(port);
                }
            }
        }
        if !stopped.is_empty() {
            info!(count = stopped.len(), "Stopped all backends");
        }
        stopped
    }
}

impl<H: BackendHandle> Default for BackendRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}
