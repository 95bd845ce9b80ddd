//! Certificate management — PEM loading and generation helpers.
//!
//! Provides:
//! - [`load_certs`] / [`load_private_key`] — PEM file loading for the relay
//! - [`CertGenerator`] — `rcgen`-backed generation for the `cert` CLI commands:
//!   a tenant CA, client certificates bound to servers, and relay server
//!   certificates
//!
//! # File format
//!
//! All certificate and key files are PEM. Tenant CA certificates are stored
//! in the configuration store in the same PEM form that `cert init-ca` writes.

use std::fs;
use std::path::Path;

use rcgen::{
    BasicConstraints, CertificateParams, DistinguishedName, DnType, ExtendedKeyUsagePurpose,
    Ia5String, IsCa, KeyPair, KeyUsagePurpose, SanType, date_time_ymd,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

use crate::{Error, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Public: PEM loading
// ─────────────────────────────────────────────────────────────────────────────

/// Load all certificates from a PEM file.
///
/// # Errors
///
/// Returns an error if the file cannot be read or contains no valid PEM
/// certificate blocks.
pub fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let pem_data = read_file(path)?;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut pem_data.as_slice())
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| {
            Error::Config(format!("Failed to parse certs from '{}': {e}", path.display()))
        })?;

    if certs.is_empty() {
        return Err(Error::Config(format!(
            "No certificates found in '{}'",
            path.display()
        )));
    }

    Ok(certs)
}

/// Load the first private key from a PEM file.
///
/// # Errors
///
/// Returns an error if the file cannot be read, contains no private key, or
/// the key format is unsupported.
pub fn load_private_key(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let pem_data = read_file(path)?;
    rustls_pemfile::private_key(&mut pem_data.as_slice())
        .map_err(|e| {
            Error::Config(format!(
                "Failed to parse private key from '{}': {e}",
                path.display()
            ))
        })?
        .ok_or_else(|| Error::Config(format!("No private key found in '{}'", path.display())))
}

// ─────────────────────────────────────────────────────────────────────────────
// Public: certificate generation
// ─────────────────────────────────────────────────────────────────────────────

/// Parameters for generating a tenant CA certificate.
#[derive(Debug)]
pub struct CaParams<'a> {
    /// Common Name for the CA (e.g. `"Acme Field Devices CA"`).
    pub cn: &'a str,
    /// Organization (optional).
    pub organization: Option<&'a str>,
    /// Validity period in days.
    pub validity_days: u32,
}

/// Parameters for a client certificate; its subject becomes the identifier
/// bound to a server in the tenant configuration.
#[derive(Debug)]
pub struct ClientCertParams<'a> {
    /// Common Name.
    pub cn: &'a str,
    /// Organization (optional).
    pub organization: Option<&'a str>,
    /// Validity period in days.
    pub validity_days: u32,
}

/// Parameters for the relay's own server certificate.
#[derive(Debug)]
pub struct ServerCertParams<'a> {
    /// Common Name.
    pub cn: &'a str,
    /// Subject Alternative Names — DNS entries.
    pub san_dns: Vec<String>,
    /// Validity period in days.
    pub validity_days: u32,
}

/// Generated certificate and key pair.
#[derive(Debug, Clone)]
pub struct GeneratedCert {
    /// PEM-encoded certificate.
    pub cert_pem: String,
    /// PEM-encoded private key.
    pub key_pem: String,
    cert_der: CertificateDer<'static>,
    key_der: Vec<u8>,
}

impl GeneratedCert {
    /// DER form of the certificate.
    #[must_use]
    pub fn cert_der(&self) -> CertificateDer<'static> {
        self.cert_der.clone()
    }

    /// DER (PKCS#8) form of the private key.
    #[must_use]
    pub fn private_key_der(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.clone()))
    }
}

/// Certificate generator backed by `rcgen`.
pub struct CertGenerator;

impl CertGenerator {
    /// Generate a self-signed tenant CA certificate.
    ///
    /// # Errors
    ///
    /// Returns an error if key generation or certificate serialisation fails.
    pub fn init_ca(params: &CaParams<'_>) -> Result<GeneratedCert> {
        let key_pair = KeyPair::generate()
            .map_err(|e| Error::Certificate(format!("Failed to generate CA key: {e}")))?;

        let mut ca_params = CertificateParams::default();
        ca_params.distinguished_name = distinguished_name(params.cn, params.organization);
        ca_params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        ca_params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        ca_params.not_after = validity_to_date(params.validity_days)?;

        let ca_cert = ca_params
            .self_signed(&key_pair)
            .map_err(|e| Error::Certificate(format!("CA cert generation failed: {e}")))?;

        Ok(GeneratedCert {
            cert_pem: ca_cert.pem(),
            key_pem: key_pair.serialize_pem(),
            cert_der: ca_cert.der().clone(),
            key_der: key_pair.serialize_der(),
        })
    }

    /// Issue a client certificate signed by the given CA.
    ///
    /// # Errors
    ///
    /// Returns an error if the CA cert/key cannot be parsed or signing fails.
    pub fn issue_client(
        params: &ClientCertParams<'_>,
        ca_cert_pem: &str,
        ca_key_pem: &str,
    ) -> Result<GeneratedCert> {
        let mut leaf = CertificateParams::default();
        leaf.distinguished_name = distinguished_name(params.cn, params.organization);
        leaf.extended_key_usages = vec![ExtendedKeyUsagePurpose::ClientAuth];
        leaf.not_after = validity_to_date(params.validity_days)?;
        Self::sign_leaf(leaf, ca_cert_pem, ca_key_pem)
    }

    /// Issue a relay server certificate signed by the given CA.
    ///
    /// # Errors
    ///
    /// Returns an error if a SAN is invalid, the CA cert/key cannot be
    /// parsed, or signing fails.
    pub fn issue_server(
        params: &ServerCertParams<'_>,
        ca_cert_pem: &str,
        ca_key_pem: &str,
    ) -> Result<GeneratedCert> {
        let mut leaf = CertificateParams::default();
        leaf.distinguished_name = distinguished_name(params.cn, None);
        leaf.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        leaf.not_after = validity_to_date(params.validity_days)?;

        let mut sans = Vec::with_capacity(params.san_dns.len());
        for dns in &params.san_dns {
            let ia5 = Ia5String::try_from(dns.as_str())
                .map_err(|e| Error::Certificate(format!("Invalid DNS SAN '{dns}': {e}")))?;
            sans.push(SanType::DnsName(ia5));
        }
        leaf.subject_alt_names = sans;

        Self::sign_leaf(leaf, ca_cert_pem, ca_key_pem)
    }

    fn sign_leaf(
        leaf_params: CertificateParams,
        ca_cert_pem: &str,
        ca_key_pem: &str,
    ) -> Result<GeneratedCert> {
        let ca_key = KeyPair::from_pem(ca_key_pem)
            .map_err(|e| Error::Certificate(format!("Failed to parse CA key: {e}")))?;
        let ca_cert = CertificateParams::from_ca_cert_pem(ca_cert_pem)
            .map_err(|e| Error::Certificate(format!("Failed to parse CA cert: {e}")))?
            .self_signed(&ca_key)
            .map_err(|e| Error::Certificate(format!("Failed to rebuild CA cert for signing: {e}")))?;

        let leaf_key = KeyPair::generate()
            .map_err(|e| Error::Certificate(format!("Failed to generate leaf key: {e}")))?;
        let leaf_cert = leaf_params
            .signed_by(&leaf_key, &ca_cert, &ca_key)
            .map_err(|e| Error::Certificate(format!("Leaf cert signing failed: {e}")))?;

        Ok(GeneratedCert {
            cert_pem: leaf_cert.pem(),
            key_pem: leaf_key.serialize_pem(),
            cert_der: leaf_cert.der().clone(),
            key_der: leaf_key.serialize_der(),
        })
    }

    /// Write a [`GeneratedCert`] to `<dir>/<stem>.crt` and `<dir>/<stem>.key`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the files
    /// cannot be written.
    pub fn write_to_dir(cert: &GeneratedCert, dir: &Path, stem: &str) -> Result<()> {
        fs::create_dir_all(dir)
            .map_err(|e| Error::Config(format!("Cannot create dir '{}': {e}", dir.display())))?;

        fs::write(dir.join(format!("{stem}.crt")), &cert.cert_pem)
            .map_err(|e| Error::Config(format!("Cannot write cert: {e}")))?;

        fs::write(dir.join(format!("{stem}.key")), &cert.key_pem)
            .map_err(|e| Error::Config(format!("Cannot write key: {e}")))?;

        Ok(())
    }
}

// ─────────────────────────────────────────────────────────────────────────────
// Private helpers
// ─────────────────────────────────────────────────────────────────────────────

fn read_file(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).map_err(|e| Error::Config(format!("Cannot read '{}': {e}", path.display())))
}

fn distinguished_name(cn: &str, organization: Option<&str>) -> DistinguishedName {
    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, cn);
    if let Some(org) = organization {
        dn.push(DnType::OrganizationName, org);
    }
    dn
}

/// Convert a validity period (days) into a future date for `rcgen`.
fn validity_to_date(days: u32) -> Result<time::OffsetDateTime> {
    use std::time::{SystemTime, UNIX_EPOCH};

    let now_secs = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| Error::Config(format!("System time error: {e}")))?
        .as_secs();

    let future_secs = now_secs.saturating_add(u64::from(days) * 86_400);

    let dt = time::OffsetDateTime::from_unix_timestamp(
        i64::try_from(future_secs).unwrap_or(i64::MAX),
    )
    .map_err(|e| Error::Config(format!("Date calculation error: {e}")))?;

    Ok(date_time_ymd(dt.year(), dt.month() as u8, dt.day()))
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::identity::{canonical_subject_dn, canonicalize_dn};

    fn test_ca() -> GeneratedCert {
        CertGenerator::init_ca(&CaParams {
            cn: "Test Root CA",
            organization: Some("Test Org"),
            validity_days: 365,
        })
        .unwrap()
    }

    #[test]
    fn init_ca_produces_valid_pem_cert_and_key() {
        let ca = test_ca();
        assert!(ca.cert_pem.contains("BEGIN CERTIFICATE"));
        assert!(ca.key_pem.contains("PRIVATE KEY"));
    }

    #[test]
    fn init_ca_generates_unique_keys_on_each_call() {
        assert_ne!(test_ca().key_pem, test_ca().key_pem);
    }

    #[test]
    fn client_cert_subject_matches_configured_identifier() {
        // GIVEN: a client cert for CN=Test Client, O=Test Org
        let ca = test_ca();
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
        // THEN: its canonical subject equals the canonical config identifier
        assert_eq!(
            canonical_subject_dn(leaf.cert_der().as_ref()).unwrap(),
            canonicalize_dn("CN=Test Client, O=Test Org").unwrap()
        );
    }

    #[test]
    fn server_cert_rejects_invalid_san() {
        let ca = test_ca();
        let result = CertGenerator::issue_server(
            &ServerCertParams {
                cn: "relay",
                san_dns: vec!["bäd.example".to_string()],
                validity_days: 30,
            },
            &ca.cert_pem,
            &ca.key_pem,
        );
        assert!(result.is_err());
    }

    #[test]
    fn issue_with_garbage_ca_fails() {
        let result = CertGenerator::issue_client(
            &ClientCertParams {
                cn: "x",
                organization: None,
                validity_days: 1,
            },
            "not pem",
            "not pem",
        );
        assert!(matches!(result, Err(Error::Certificate(_))));
    }

    #[test]
    fn written_files_load_back() {
        let ca = test_ca();
        let dir = tempfile::tempdir().unwrap();
        CertGenerator::write_to_dir(&ca, dir.path(), "ca").unwrap();

        let certs = load_certs(&dir.path().join("ca.crt")).unwrap();
        assert_eq!(certs.len(), 1);
        assert_eq!(certs[0], ca.cert_der());
        load_private_key(&dir.path().join("ca.key")).unwrap();
    }

    #[test]
    fn load_certs_rejects_file_without_certs() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty.pem");
        fs::write(&path, "nothing here").unwrap();
        assert!(matches!(load_certs(&path), Err(Error::Config(_))));
    }

    #[test]
    fn load_private_key_missing_file_is_config_error() {
        assert!(matches!(
            load_private_key(Path::new("/nonexistent/key.pem")),
            Err(Error::Config(_))
        ));
    }
}
