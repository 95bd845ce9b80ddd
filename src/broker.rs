//! Proxy authorization orchestrator.
//!
//! [`Broker::authorize`] turns a certificate-authenticated connection
//! request into [`ProxyConnectionSettings`]: it resolves the client to a
//! tenant server, builds that tenant's trust policy, loads the server's
//! points, reserves a port and provisions a backend on it. The call is
//! all-or-nothing; a failure after the port is reserved releases it before
//! the error is returned.

use std::net::IpAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use broker_model::{ServerId, TenantId};
use rustls::pki_types::CertificateDer;
use tracing::{debug, info, instrument, warn};

use crate::authorization::AuthorizationResolver;
use crate::backend::{
    BackendHandle, BackendLease, BackendProvisioner, BackendRegistry, BackendSpec,
};
use crate::identity::{canonical_subject_dn, canonicalize_dn};
use crate::points::PointMappingLoader;
use crate::ports::PortAllocator;
use crate::store::ConfigurationStore;
use crate::trust::{TrustPolicy, TrustStoreBuilder};
use crate::{Error, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Request and settings
// ─────────────────────────────────────────────────────────────────────────────

/// An authenticated inbound connection awaiting authorization.
///
/// The chain is an immutable snapshot owned by the request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConnectionRequest {
    principal: String,
    identity: Vec<CertificateDer<'static>>,
}

impl ConnectionRequest {
    /// `principal` is the subject DN the frontend derived from the leaf;
    /// `identity` is the presented chain, leaf first.
    #[must_use]
    pub fn new(principal: impl Into<String>, identity: Vec<CertificateDer<'static>>) -> Self {
        Self {
            principal: principal.into(),
            identity,
        }
    }

    /// Subject DN claimed by the frontend.
    #[must_use]
    pub fn principal(&self) -> &str {
        &self.principal
    }

    /// Presented chain, leaf first.
    #[must_use]
    pub fn identity(&self) -> &[CertificateDer<'static>] {
        &self.identity
    }

    /// The end-entity certificate, if any.
    #[must_use]
    pub fn leaf(&self) -> Option<&CertificateDer<'static>> {
        self.identity.first()
    }
}

/// Where the frontend should relay the connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProxyConfiguration {
    /// Backend host.
    pub destination_host: IpAddr,
    /// Backend port; the port reserved for this connection.
    pub destination_port: u16,
}

/// Start/stop hooks binding a relayed connection to its backend.
///
/// Each hook takes effect at most once. `on_stop` before `on_start` is
/// allowed and still releases everything; `on_start` after `on_stop` fails.
/// Dropping the lifecycle without `on_stop` stops the backend in the
/// background and then releases the port.
pub struct ConnectionLifecycle<H: BackendHandle> {
    lease: Arc<BackendLease<H>>,
    registry: Arc<BackendRegistry<H>>,
    started: AtomicBool,
}

impl<H: BackendHandle> ConnectionLifecycle<H> {
    /// Enable the backend once the relay is ready to forward traffic.
    ///
    /// # Errors
    ///
    /// `Error::InvalidState` if the connection was already stopped, or the
    /// backend's own enable error.
    pub fn on_start(&self) -> Result<()> {
        if self.lease.is_stopped() {
            return Err(Error::InvalidState(format!(
                "Connection on port {} already stopped",
                self.lease.port()
            )));
        }
        if self.started.swap(true, Ordering::AcqRel) {
            debug!(port = self.lease.port(), "on_start already invoked");
            return Ok(());
        }
        self.lease.backend().enable()
    }

    /// Stop the backend and release its port.
    ///
    /// The port is released only after the backend's sockets are closed.
    /// A no-op once the connection was stopped, including by
    /// [`Broker::shutdown`].
    pub async fn on_stop(&self) {
        self.registry.remove(&self.lease);
        if self.lease.stop().await {
            debug!(port = self.lease.port(), "Connection resources released");
        } else {
            debug!(port = self.lease.port(), "Connection already stopped");
        }
    }

    /// The backend serving this connection.
    #[must_use]
    pub fn backend(&self) -> &Arc<H> {
        self.lease.backend()
    }
}

impl<H: BackendHandle> Drop for ConnectionLifecycle<H> {
    fn drop(&mut self) {
        if self.lease.is_stopped() {
            return;
        }
        self.registry.remove(&self.lease);
        if self.lease.stop_detached() {
            warn!(
                port = self.lease.port(),
                "Connection dropped without on_stop, releasing in background"
            );
        }
    }
}

/// A reserved port that goes back to the allocator unless handed over.
struct PortReservation {
    port: u16,
    ports: Arc<dyn PortAllocator>,
    held: bool,
}

impl PortReservation {
    fn reserve(ports: &Arc<dyn PortAllocator>) -> Result<Self> {
        Ok(Self {
            port: ports.reserve()?,
            ports: Arc::clone(ports),
            held: true,
        })
    }

    fn hand_over(mut self) -> u16 {
        self.held = false;
        self.port
    }
}

impl Drop for PortReservation {
    fn drop(&mut self) {
        if self.held {
            self.ports.release(self.port);
        }
    }
}

/// Everything the frontend needs to relay one authorized connection.
pub struct ProxyConnectionSettings<H: BackendHandle> {
    connection_request: Arc<ConnectionRequest>,
    client_trust_store: TrustPolicy,
    proxy: ProxyConfiguration,
    tenant_id: TenantId,
    server_id: ServerId,
    lifecycle: ConnectionLifecycle<H>,
}

impl<H: BackendHandle> ProxyConnectionSettings<H> {
    /// The request this authorization answered (the same allocation).
    #[must_use]
    pub fn connection_request(&self) -> &Arc<ConnectionRequest> {
        &self.connection_request
    }

    /// Trust policy for the client's tenant.
    #[must_use]
    pub fn client_trust_store(&self) -> &TrustPolicy {
        &self.client_trust_store
    }

    /// Relay destination.
    #[must_use]
    pub fn proxy(&self) -> ProxyConfiguration {
        self.proxy
    }

    /// Shorthand for `proxy().destination_host`.
    #[must_use]
    pub fn destination_host(&self) -> IpAddr {
        self.proxy.destination_host
    }

    /// Shorthand for `proxy().destination_port`.
    #[must_use]
    pub fn destination_port(&self) -> u16 {
        self.proxy.destination_port
    }

    /// Tenant the client resolved to.
    #[must_use]
    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    /// Server the client resolved to.
    #[must_use]
    pub fn server_id(&self) -> &ServerId {
        &self.server_id
    }

    /// Validate the request's chain against the tenant trust policy.
    ///
    /// Frontends must call this before [`Self::on_start`].
    ///
    /// # Errors
    ///
    /// `Error::UntrustedIdentity` if the chain does not validate.
    pub fn verify_client(&self) -> Result<()> {
        self.client_trust_store
            .verify(self.connection_request.identity())
    }

    /// See [`ConnectionLifecycle::on_start`].
    ///
    /// # Errors
    ///
    /// See [`ConnectionLifecycle::on_start`].
    pub fn on_start(&self) -> Result<()> {
        self.lifecycle.on_start()
    }

    /// See [`ConnectionLifecycle::on_stop`].
    pub async fn on_stop(&self) {
        self.lifecycle.on_stop().await;
    }

    /// Lifecycle hooks.
    #[must_use]
    pub fn lifecycle(&self) -> &ConnectionLifecycle<H> {
        &self.lifecycle
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Broker
// ─────────────────────────────────────────────────────────────────────────────

/// Authorizes connections and provisions their backends.
pub struct Broker<P: BackendProvisioner> {
    resolver: AuthorizationResolver,
    trust: TrustStoreBuilder,
    points: PointMappingLoader,
    ports: Arc<dyn PortAllocator>,
    provisioner: P,
    registry: Arc<BackendRegistry<P::Handle>>,
}

impl<P: BackendProvisioner> Broker<P> {
    /// Create a broker over the given collaborators.
    pub fn new(
        store: Arc<dyn ConfigurationStore>,
        ports: Arc<dyn PortAllocator>,
        provisioner: P,
    ) -> Self {
        Self {
            resolver: AuthorizationResolver::new(Arc::clone(&store)),
            trust: TrustStoreBuilder::new(Arc::clone(&store)),
            points: PointMappingLoader::new(store),
            ports,
            provisioner,
            registry: Arc::new(BackendRegistry::new()),
        }
    }

    /// Live backends.
    #[must_use]
    pub fn registry(&self) -> &Arc<BackendRegistry<P::Handle>> {
        &self.registry
    }

    /// Authorize one connection.
    ///
    /// # Errors
    ///
    /// - `Error::Authorization` if the chain is empty, the leaf does not
    ///   match the principal, or no enabled binding exists.
    /// - `Error::ConfigurationInconsistency` on duplicate bindings or
    ///   point indices.
    /// - `Error::ResourceExhausted` if no port is free.
    /// - `Error::ProvisioningFailure` if the backend cannot start.
    #[instrument(skip_all, fields(principal = %request.principal()))]
    pub async fn authorize(
        &self,
        request: Arc<ConnectionRequest>,
    ) -> Result<ProxyConnectionSettings<P::Handle>> {
        let outcome = self.authorize_inner(request).await;
        let label = match &outcome {
            Ok(_) => "authorized",
            Err(e) => e.kind(),
        };
        telemetry_metrics::counter!("broker_authorizations_total", "outcome" => label)
            .increment(1);
        if let Err(e) = &outcome {
            warn!(outcome = label, error = %e, "Authorization refused");
        }
        outcome
    }

    async fn authorize_inner(
        &self,
        request: Arc<ConnectionRequest>,
    ) -> Result<ProxyConnectionSettings<P::Handle>> {
        let principal = verify_principal(&request)?;

        let binding = self.resolver.resolve(&principal).await?;
        let trust = self.trust.build(&binding.tenant_id).await?;
        let points = self.points.load(&binding.tenant_id, &binding.server_id).await?;

        let reservation = PortReservation::reserve(&self.ports)?;
        let spec = BackendSpec {
            tenant_id: binding.tenant_id.clone(),
            server_id: binding.server_id.clone(),
            port: reservation.port,
            points,
        };
        // Dropping the reservation on error or cancellation returns the port.
        let backend = Arc::new(self.provisioner.start(spec).await?);
        let port = reservation.hand_over();
        let lease = Arc::new(BackendLease::new(
            port,
            Arc::clone(&backend),
            Arc::clone(&self.ports),
        ));
        self.registry.register(Arc::clone(&lease));

        info!(
            tenant = %binding.tenant_id,
            server = %binding.server_id,
            port,
            trusted_issuers = trust.len(),
            "Connection authorized"
        );

        Ok(ProxyConnectionSettings {
            proxy: ProxyConfiguration {
                destination_host: backend.local_addr().ip(),
                destination_port: port,
            },
            connection_request: request,
            client_trust_store: trust,
            tenant_id: binding.tenant_id,
            server_id: binding.server_id,
            lifecycle: ConnectionLifecycle {
                lease,
                registry: Arc::clone(&self.registry),
                started: AtomicBool::new(false),
            },
        })
    }

    /// Stop every live backend and release its port.
    ///
    /// Connections stopped here treat a later `on_stop` as a no-op.
    pub async fn shutdown(&self) {
        let stopped = self.registry.shutdown_all().await;
        debug!(count = stopped.len(), "Broker shut down");
    }
}

/// Canonical principal, checked against the leaf certificate's subject.
fn verify_principal(request: &ConnectionRequest) -> Result<String> {
    let leaf = request
        .leaf()
        .ok_or_else(|| Error::Authorization("Empty certificate chain".to_string()))?;
    let subject = canonical_subject_dn(leaf.as_ref())
        .map_err(|e| Error::Authorization(format!("Unreadable leaf certificate: {e}")))?;
    let principal = canonicalize_dn(request.principal())
        .map_err(|e| Error::Authorization(format!("Unusable principal: {e}")))?;

    if subject != principal {
        return Err(Error::Authorization(format!(
            "Principal '{principal}' does not match certificate subject '{subject}'"
        )));
    }
    Ok(principal)
}
