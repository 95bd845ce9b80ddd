//! TLS relay frontend.
//!
//! Terminates client TLS, requires a client certificate, asks the broker to
//! authorize the connection and then shuttles bytes between the client and
//! the provisioned backend. The handshake only checks that the client holds
//! the key for the certificate it presented; path validation happens after
//! authorization, against the trust policy of the tenant the certificate
//! resolved to.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use rustls::client::danger::HandshakeSignatureValid;
use rustls::crypto::{WebPkiSupportedAlgorithms, verify_tls12_signature, verify_tls13_signature};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, UnixTime};
use rustls::server::danger::{ClientCertVerified, ClientCertVerifier};
use rustls::{DigitallySignedStruct, DistinguishedName, ServerConfig, SignatureScheme};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::task::JoinSet;
use tokio_rustls::TlsAcceptor;
use tracing::{Instrument, debug, info, info_span, warn};
use uuid::Uuid;

use crate::backend::BackendProvisioner;
use crate::broker::{Broker, ConnectionRequest};
use crate::identity::CertIdentity;
use crate::{Error, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Client certificate handling
// ─────────────────────────────────────────────────────────────────────────────

/// Requires a client certificate and checks handshake signatures, leaving
/// chain validation to the tenant trust policy.
#[derive(Debug)]
struct DeferredClientVerifier {
    algorithms: WebPkiSupportedAlgorithms,
}

impl ClientCertVerifier for DeferredClientVerifier {
    fn client_auth_mandatory(&self) -> bool {
        true
    }

    fn root_hint_subjects(&self) -> &[DistinguishedName] {
        &[]
    }

    fn verify_client_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _now: UnixTime,
    ) -> std::result::Result<ClientCertVerified, rustls::Error> {
        Ok(ClientCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls12_signature(message, cert, dss, &self.algorithms)
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> std::result::Result<HandshakeSignatureValid, rustls::Error> {
        verify_tls13_signature(message, cert, dss, &self.algorithms)
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.algorithms.supported_schemes()
    }
}

/// Build the relay's rustls server configuration.
///
/// # Errors
///
/// Returns `Error::Tls` if the certificate and key do not form a usable pair.
pub fn server_config(
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
) -> Result<Arc<ServerConfig>> {
    let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
    let verifier = Arc::new(DeferredClientVerifier {
        algorithms: provider.signature_verification_algorithms,
    });
    let config = ServerConfig::builder_with_provider(provider)
        .with_protocol_versions(&[&rustls::version::TLS13])?
        .with_client_cert_verifier(verifier)
        .with_single_cert(cert_chain, key)?;
    Ok(Arc::new(config))
}

// ─────────────────────────────────────────────────────────────────────────────
// Relay
// ─────────────────────────────────────────────────────────────────────────────

/// Accepts client connections and relays them to per-connection backends.
pub struct Relay<P: BackendProvisioner> {
    broker: Arc<Broker<P>>,
    acceptor: TlsAcceptor,
    handshake_timeout: Duration,
}

impl<P: BackendProvisioner> Relay<P> {
    /// Create a relay in front of `broker`.
    #[must_use]
    pub fn new(
        broker: Arc<Broker<P>>,
        tls: Arc<ServerConfig>,
        handshake_timeout: Duration,
    ) -> Self {
        Self {
            broker,
            acceptor: TlsAcceptor::from(tls),
            handshake_timeout,
        }
    }

    /// Accept connections until `shutdown` fires, then abort open relays.
    ///
    /// Aborted relays drop their connection settings, which stops their
    /// backends in the background; call [`Broker::shutdown`] afterwards to
    /// stop whatever is still live.
    pub async fn serve(self: Arc<Self>, listener: TcpListener, mut shutdown: broadcast::Receiver<()>) {
        if let Ok(addr) = listener.local_addr() {
            info!(%addr, "Relay listening");
        }
        let mut connections = JoinSet::new();

        loop {
            tokio::select! {
                _ = shutdown.recv() => break,
                accepted = listener.accept() => match accepted {
                    Ok((stream, peer)) => {
                        let relay = Arc::clone(&self);
                        let span = info_span!("connection", conn_id = %Uuid::new_v4(), %peer);
                        connections.spawn(
                            async move {
                                if let Err(e) = relay.handle(stream, peer).await {
                                    warn!(kind = e.kind(), error = %e, "Connection refused");
                                }
                            }
                            .instrument(span),
                        );
                    }
                    Err(e) => {
                        warn!(error = %e, "Relay accept failed");
                        tokio::time::sleep(Duration::from_millis(50)).await;
                    }
                },
                Some(_) = connections.join_next(), if !connections.is_empty() => {}
            }
        }

        info!(open = connections.len(), "Relay shutting down");
        connections.shutdown().await;
    }

    /// Drive one client connection to completion.
    async fn handle(&self, stream: TcpStream, peer: SocketAddr) -> Result<()> {
        debug!(%peer, "Client connected");
        let mut tls = tokio::time::timeout(self.handshake_timeout, self.acceptor.accept(stream))
            .await
            .map_err(|_| Error::Authorization("TLS handshake timed out".to_string()))??;

        let chain: Vec<CertificateDer<'static>> = tls
            .get_ref()
            .1
            .peer_certificates()
            .map(<[CertificateDer<'static>]>::to_vec)
            .unwrap_or_default();
        let leaf = chain
            .first()
            .ok_or_else(|| Error::Authorization("No client certificate".to_string()))?;
        let identity = CertIdentity::from_der(leaf.as_ref())
            .map_err(|e| Error::Authorization(format!("Unreadable client certificate: {e}")))?;
        debug!(client = %identity.display_name, "Client certificate presented");

        let request = Arc::new(ConnectionRequest::new(identity.subject, chain));
        let settings = self.broker.authorize(request).await?;

        if let Err(e) = settings.verify_client() {
            settings.on_stop().await;
            return Err(e);
        }

        let destination = SocketAddr::new(settings.destination_host(), settings.destination_port());
        let mut upstream = match TcpStream::connect(destination).await {
            Ok(upstream) => upstream,
            Err(e) => {
                settings.on_stop().await;
                return Err(Error::ProvisioningFailure(format!(
                    "Backend {destination} unreachable: {e}"
                )));
            }
        };
        if let Err(e) = settings.on_start() {
            settings.on_stop().await;
            return Err(e);
        }

        info!(
            tenant = %settings.tenant_id(),
            server = %settings.server_id(),
            port = destination.port(),
            "Relaying"
        );
        match tokio::io::copy_bidirectional(&mut tls, &mut upstream).await {
            Ok((to_backend, to_client)) => {
                debug!(to_backend, to_client, "Relay finished");
            }
            Err(e) => debug!(error = %e, "Relay ended with error"),
        }

        settings.on_stop().await;
        Ok(())
    }
}
