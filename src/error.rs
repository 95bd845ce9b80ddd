//! Error types for the outstation broker

use std::io;

use thiserror::Error;

/// Result type alias for the outstation broker
pub type Result<T> = std::result::Result<T, Error>;

/// Outstation broker errors
///
/// Every failure of [`crate::broker::Broker::authorize`] is fatal to the
/// connection attempt; callers must close the connection without relaying.
#[derive(Error, Debug)]
pub enum Error {
    /// Principal mismatch or no enabled binding for the certificate
    #[error("Not authorized: {0}")]
    Authorization(String),

    /// Presented chain does not validate against the tenant's trust policy
    #[error("Untrusted identity: {0}")]
    UntrustedIdentity(String),

    /// No ports left in the configured range
    #[error("Resource exhausted: {0}")]
    ResourceExhausted(String),

    /// Backend failed to bind or start
    #[error("Provisioning failure: {0}")]
    ProvisioningFailure(String),

    /// Tenant configuration violates an integrity constraint
    #[error("Configuration inconsistency: {0}")]
    ConfigurationInconsistency(String),

    /// Broker configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Certificate or distinguished name could not be parsed
    #[error("Certificate error: {0}")]
    Certificate(String),

    /// Collaborator store lookup failed
    #[error("Store error: {0}")]
    Store(String),

    /// Backend is not in a state that allows the requested transition
    #[error("Invalid backend state: {0}")]
    InvalidState(String),

    /// TLS error
    #[error("TLS error: {0}")]
    Tls(#[from] rustls::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Short, stable label used for metrics and audit logs.
    #[must_use]
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Authorization(_) => "not_authorized",
            Self::UntrustedIdentity(_) => "untrusted_identity",
            Self::ResourceExhausted(_) => "resource_exhausted",
            Self::ProvisioningFailure(_) => "provisioning_failure",
            Self::ConfigurationInconsistency(_) => "configuration_inconsistency",
            Self::Config(_) => "config",
            Self::Certificate(_) => "certificate",
            Self::Store(_) => "store",
            Self::InvalidState(_) => "invalid_state",
            Self::Tls(_) => "tls",
            Self::Io(_) => "io",
            Self::Json(_) => "json",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_labels_are_stable() {
        assert_eq!(Error::Authorization("x".into()).kind(), "not_authorized");
        assert_eq!(Error::ResourceExhausted("x".into()).kind(), "resource_exhausted");
        assert_eq!(
            Error::ConfigurationInconsistency("x".into()).kind(),
            "configuration_inconsistency"
        );
    }

    #[test]
    fn display_includes_detail() {
        let e = Error::UntrustedIdentity("no trusted issuers for tenant acme".into());
        assert_eq!(
            e.to_string(),
            "Untrusted identity: no trusted issuers for tenant acme"
        );
    }
}
