//! Per-tenant trust policy construction and chain validation.
//!
//! A [`TrustPolicy`] is rebuilt from the configuration store on every
//! authorization and is owned by exactly one connection. Disabling a tenant's
//! CA row therefore takes effect on the very next connection attempt.
//!
//! Cryptographic enforcement happens at the frontend: after `authorize`
//! returns, the frontend must call [`TrustPolicy::verify`] on the chain the
//! client presented and refuse to relay if it fails.

use std::sync::Arc;

use broker_model::TenantId;
use rustls::RootCertStore;
use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, UnixTime};
use rustls::server::WebPkiClientVerifier;
use rustls::server::danger::ClientCertVerifier;
use tracing::{debug, warn};

use crate::store::ConfigurationStore;
use crate::{Error, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Trust policy
// ─────────────────────────────────────────────────────────────────────────────

/// The set of CAs accepted for one tenant's connection.
#[derive(Debug, Clone)]
pub struct TrustPolicy {
    tenant_id: TenantId,
    roots: Arc<RootCertStore>,
}

impl TrustPolicy {
    /// Wrap an already-populated root store.
    #[must_use]
    pub fn new(tenant_id: TenantId, roots: RootCertStore) -> Self {
        Self {
            tenant_id,
            roots: Arc::new(roots),
        }
    }

    /// Tenant this policy belongs to.
    #[must_use]
    pub fn tenant_id(&self) -> &TenantId {
        &self.tenant_id
    }

    /// `true` if no CA is trusted; such a policy validates nothing.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.roots.is_empty()
    }

    /// Number of trusted CAs.
    #[must_use]
    pub fn len(&self) -> usize {
        self.roots.len()
    }

    /// Build a rustls client verifier enforcing this policy.
    ///
    /// # Errors
    ///
    /// Returns `Error::UntrustedIdentity` for an empty policy, because an
    /// empty root set must never be turned into an accept-all verifier.
    pub fn client_verifier(&self) -> Result<Arc<dyn ClientCertVerifier>> {
        if self.is_empty() {
            return Err(Error::UntrustedIdentity(format!(
                "Tenant '{}' has no trusted issuers",
                self.tenant_id
            )));
        }
        let provider = Arc::new(rustls::crypto::aws_lc_rs::default_provider());
        WebPkiClientVerifier::builder_with_provider(Arc::clone(&self.roots), provider)
            .build()
            .map_err(|e| Error::UntrustedIdentity(format!("Cannot build verifier: {e}")))
    }

    /// Validate a leaf-first certificate chain against this policy.
    ///
    /// # Errors
    ///
    /// Returns `Error::UntrustedIdentity` if the policy is empty, the chain
    /// is empty, or path validation fails.
    pub fn verify(&self, chain: &[CertificateDer<'_>]) -> Result<()> {
        let (leaf, intermediates) = chain
            .split_first()
            .ok_or_else(|| Error::UntrustedIdentity("Empty certificate chain".to_string()))?;
        let verifier = self.client_verifier()?;
        verifier
            .verify_client_cert(leaf, intermediates, UnixTime::now())
            .map_err(|e| {
                Error::UntrustedIdentity(format!(
                    "Chain rejected by tenant '{}' trust policy: {e}",
                    self.tenant_id
                ))
            })?;
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Builder
// ─────────────────────────────────────────────────────────────────────────────

/// Builds tenant trust policies from the configuration store.
#[derive(Clone)]
pub struct TrustStoreBuilder {
    store: Arc<dyn ConfigurationStore>,
}

impl TrustStoreBuilder {
    /// Create a builder over the given configuration store.
    pub fn new(store: Arc<dyn ConfigurationStore>) -> Self {
        Self { store }
    }

    /// Collect every enabled trusted issuer for `tenant` into a fresh policy.
    ///
    /// Rows whose PEM cannot be parsed are skipped with a warning; they
    /// contribute no trust.
    ///
    /// # Errors
    ///
    /// Propagates configuration store failures.
    pub async fn build(&self, tenant: &TenantId) -> Result<TrustPolicy> {
        let rows = self.store.trusted_issuers(tenant).await?;
        let mut roots = RootCertStore::empty();

        for row in rows.iter().filter(|row| row.enabled) {
            let certs = rustls_pemfile::certs(&mut row.ca_certificate.as_bytes())
                .collect::<std::result::Result<Vec<_>, _>>();
            match certs {
                Ok(certs) if !certs.is_empty() => {
                    for cert in certs {
                        if let Err(e) = roots.add(cert) {
                            warn!(tenant = %tenant, error = %e, "Skipping unusable trusted issuer");
                        }
                    }
                }
                Ok(_) => warn!(tenant = %tenant, "Trusted issuer row contains no certificate"),
                Err(e) => warn!(tenant = %tenant, error = %e, "Skipping unparseable trusted issuer"),
            }
        }

        debug!(tenant = %tenant, roots = roots.len(), "Trust policy built");
        Ok(TrustPolicy::new(tenant.clone(), roots))
    }
}

/// Ensure a process-wide default crypto provider is installed.
///
/// Safe to call repeatedly; only the first call has an effect.
pub fn ensure_crypto_provider() {
    let _ = CryptoProvider::install_default(rustls::crypto::aws_lc_rs::default_provider());
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::certs::{CaParams, CertGenerator, ClientCertParams};
    use crate::store::InMemoryConfigurationStore;
    use broker_model::{TenantConfiguration, TrustedIssuerCertificate};

    fn ca(cn: &str) -> crate::certs::GeneratedCert {
        CertGenerator::init_ca(&CaParams {
            cn,
            organization: None,
            validity_days: 30,
        })
        .unwrap()
    }

    fn client_chain(ca: &crate::certs::GeneratedCert) -> Vec<CertificateDer<'static>> {
        let leaf = CertGenerator::issue_client(
            &ClientCertParams {
                cn: "Test Client",
                organization: Some("Test Org"),
                validity_days: 30,
            },
            &ca.cert_pem,
            &ca.key_pem,
        )
        .unwrap();
        vec![leaf.cert_der(), ca.cert_der()]
    }

    fn builder(issuers: Vec<TrustedIssuerCertificate>) -> TrustStoreBuilder {
        let doc = TenantConfiguration {
            trusted_issuers: issuers,
            ..TenantConfiguration::default()
        };
        TrustStoreBuilder::new(Arc::new(InMemoryConfigurationStore::new(doc).unwrap()))
    }

    fn issuer(tenant: &str, pem: &str, enabled: bool) -> TrustedIssuerCertificate {
        TrustedIssuerCertificate {
            tenant_id: TenantId::from(tenant),
            ca_certificate: pem.to_string(),
            enabled,
        }
    }

    #[tokio::test]
    async fn tenant_without_issuers_gets_empty_policy() {
        let policy = builder(vec![]).build(&TenantId::from("u")).await.unwrap();
        assert!(policy.is_empty());
        assert!(matches!(
            policy.client_verifier(),
            Err(Error::UntrustedIdentity(_))
        ));
    }

    #[tokio::test]
    async fn empty_policy_validates_nothing() {
        let authority = ca("Root");
        let policy = builder(vec![]).build(&TenantId::from("u")).await.unwrap();
        let err = policy.verify(&client_chain(&authority)).unwrap_err();
        assert!(matches!(err, Error::UntrustedIdentity(_)));
    }

    #[tokio::test]
    async fn disabled_issuers_are_ignored() {
        let authority = ca("Root");
        let policy = builder(vec![issuer("u", &authority.cert_pem, false)])
            .build(&TenantId::from("u"))
            .await
            .unwrap();
        assert!(policy.is_empty());
    }

    #[tokio::test]
    async fn other_tenants_issuers_are_ignored() {
        let authority = ca("Root");
        let policy = builder(vec![issuer("v", &authority.cert_pem, true)])
            .build(&TenantId::from("u"))
            .await
            .unwrap();
        assert!(policy.is_empty());
    }

    #[tokio::test]
    async fn unparseable_rows_are_skipped() {
        let authority = ca("Root");
        let policy = builder(vec![
            issuer("u", "garbage", true),
            issuer("u", &authority.cert_pem, true),
        ])
        .build(&TenantId::from("u"))
        .await
        .unwrap();
        assert_eq!(policy.len(), 1);
    }

    #[tokio::test]
    async fn chain_signed_by_trusted_ca_validates() {
        let authority = ca("Root");
        let policy = builder(vec![issuer("u", &authority.cert_pem, true)])
            .build(&TenantId::from("u"))
            .await
            .unwrap();
        policy.verify(&client_chain(&authority)).unwrap();
    }

    #[tokio::test]
    async fn chain_signed_by_other_ca_is_untrusted() {
        let trusted = ca("Trusted Root");
        let rogue = ca("Rogue Root");
        let policy = builder(vec![issuer("u", &trusted.cert_pem, true)])
            .build(&TenantId::from("u"))
            .await
            .unwrap();
        let err = policy.verify(&client_chain(&rogue)).unwrap_err();
        assert!(matches!(err, Error::UntrustedIdentity(_)));
    }

    #[tokio::test]
    async fn empty_chain_is_untrusted() {
        let authority = ca("Root");
        let policy = builder(vec![issuer("u", &authority.cert_pem, true)])
            .build(&TenantId::from("u"))
            .await
            .unwrap();
        assert!(matches!(
            policy.verify(&[]),
            Err(Error::UntrustedIdentity(_))
        ));
    }

    #[tokio::test]
    async fn each_build_is_fresh() {
        let authority = ca("Root");
        let b = builder(vec![issuer("u", &authority.cert_pem, true)]);
        let first = b.build(&TenantId::from("u")).await.unwrap();
        let second = b.build(&TenantId::from("u")).await.unwrap();
        assert!(!Arc::ptr_eq(&first.roots, &second.roots));
    }
}
