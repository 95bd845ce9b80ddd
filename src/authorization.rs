//! Client identifier → (tenant, server) resolution.

use std::sync::Arc;

use broker_model::{ServerId, TenantId};
use tracing::debug;

use crate::identity::canonicalize_dn;
use crate::store::ConfigurationStore;
use crate::{Error, Result};

/// The server a client certificate is bound to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ServerBinding {
    /// Owning tenant.
    pub tenant_id: TenantId,
    /// Target server.
    pub server_id: ServerId,
}

/// Maps certificate identifiers to server bindings.
#[derive(Clone)]
pub struct AuthorizationResolver {
    store: Arc<dyn ConfigurationStore>,
}

impl AuthorizationResolver {
    /// Create a resolver over the given configuration store.
    pub fn new(store: Arc<dyn ConfigurationStore>) -> Self {
        Self { store }
    }

    /// Resolve `identifier` to exactly one enabled binding.
    ///
    /// The identifier is canonicalised first, so any spelling of the same DN
    /// resolves identically.
    ///
    /// # Errors
    ///
    /// - `Error::Authorization` if the identifier is not a DN or no enabled
    ///   row matches it.
    /// - `Error::ConfigurationInconsistency` if more than one enabled row
    ///   matches.
    pub async fn resolve(&self, identifier: &str) -> Result<ServerBinding> {
        let canonical = canonicalize_dn(identifier)
            .map_err(|e| Error::Authorization(format!("Unusable identifier: {e}")))?;

        let mut enabled = self
            .store
            .auth_configurations(&canonical)
            .await?
            .into_iter()
            .filter(|row| row.enabled);

        let Some(row) = enabled.next() else {
            return Err(Error::Authorization(format!(
                "No enabled server binding for '{canonical}'"
            )));
        };
        if enabled.next().is_some() {
            return Err(Error::ConfigurationInconsistency(format!(
                "Client identifier '{canonical}' is bound to more than one enabled server"
            )));
        }

        debug!(tenant = %row.tenant_id, server = %row.server_id, "Client identifier resolved");
        Ok(ServerBinding {
            tenant_id: row.tenant_id,
            server_id: row.server_id,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::store::InMemoryConfigurationStore;

    fn resolver(doc: &str) -> AuthorizationResolver {
        AuthorizationResolver::new(Arc::new(InMemoryConfigurationStore::from_yaml_str(doc).unwrap()))
    }

    #[tokio::test]
    async fn resolves_enabled_binding() {
        let r = resolver(
            "auth:\n  - {tenant_id: u, server_id: s, client_identifier: 'CN=Test Client, O=Test Org'}",
        );
        let binding = r.resolve("O=Test Org, CN=Test Client").await.unwrap();
        assert_eq!(binding.tenant_id, TenantId::from("u"));
        assert_eq!(binding.server_id, ServerId::from("s"));
    }

    #[tokio::test]
    async fn unknown_identifier_is_not_authorized() {
        let r = resolver("auth: []");
        let err = r.resolve("CN=stranger").await.unwrap_err();
        assert!(matches!(err, Error::Authorization(_)));
    }

    #[tokio::test]
    async fn disabled_binding_is_not_authorized() {
        let r = resolver(
            "auth:\n  - {tenant_id: u, server_id: s, client_identifier: 'CN=a', enabled: false}",
        );
        assert!(matches!(
            r.resolve("CN=a").await,
            Err(Error::Authorization(_))
        ));
    }

    #[tokio::test]
    async fn disabled_duplicates_do_not_conflict() {
        let r = resolver(
            "auth:\n  - {tenant_id: u, server_id: old, client_identifier: 'CN=a', enabled: false}\n  - {tenant_id: u, server_id: new, client_identifier: 'CN=a'}",
        );
        let binding = r.resolve("CN=a").await.unwrap();
        assert_eq!(binding.server_id, ServerId::from("new"));
    }

    #[tokio::test]
    async fn two_enabled_bindings_fail_closed() {
        let r = resolver(
            "auth:\n  - {tenant_id: u, server_id: s1, client_identifier: 'CN=a'}\n  - {tenant_id: v, server_id: s2, client_identifier: 'cn=A'}",
        );
        assert!(matches!(
            r.resolve("CN=a").await,
            Err(Error::ConfigurationInconsistency(_))
        ));
    }

    #[tokio::test]
    async fn malformed_identifier_is_not_authorized() {
        let r = resolver("auth: []");
        assert!(matches!(
            r.resolve("not a dn").await,
            Err(Error::Authorization(_))
        ));
    }
}
