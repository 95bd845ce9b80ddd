//! Certificate identity extraction and subject DN canonicalisation.
//!
//! Client certificates are bound to servers by their subject distinguished
//! name. Two spellings of the same DN must compare equal, so both the
//! certificate side and the configuration side are reduced to one canonical
//! string before any comparison:
//!
//! - attribute types become upper-case short names (`CN`, `O`, `OU`, …);
//!   unknown types keep their dotted OID
//! - values are trimmed, inner whitespace collapsed, and lower-cased
//! - attributes are sorted, then joined with `,`
//!
//! RDN grouping is flattened: a multi-valued RDN such as `CN=a+O=b` and the
//! two single-valued RDNs `CN=a,O=b` name the same identity. Bindings
//! therefore cannot tell the two subject layouts apart.
//!
//! `"CN=Test Client, O=Test Org"` and `"o=test org,cn=TEST  client"` both
//! canonicalise to `"CN=test client,O=test org"`.

use x509_parser::certificate::X509Certificate;
use x509_parser::prelude::FromDer;

use crate::{Error, Result};

// ─────────────────────────────────────────────────────────────────────────────
// Certificate identity
// ─────────────────────────────────────────────────────────────────────────────

/// Identity fields of a presented client certificate.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CertIdentity {
    /// Canonical subject DN.
    pub subject: String,

    /// Certificate Common Name (CN), original spelling.
    pub common_name: Option<String>,

    /// Pre-computed human-readable label for logs.
    pub display_name: String,
}

impl CertIdentity {
    /// Parse a DER-encoded certificate and extract its identity fields.
    ///
    /// # Errors
    ///
    /// Returns `Error::Certificate` if the certificate cannot be parsed or
    /// its subject contains no usable attributes.
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let cert = parse_certificate(der)?;
        let subject = canonical_subject(&cert)?;
        let common_name = cert
            .subject()
            .iter_common_name()
            .next()
            .and_then(|attr| attr.as_str().ok())
            .map(str::to_owned);
        let display_name = common_name
            .clone()
            .unwrap_or_else(|| subject.clone());

        Ok(Self {
            subject,
            common_name,
            display_name,
        })
    }
}

/// Canonical subject DN of a DER-encoded certificate.
///
/// # Errors
///
/// Returns `Error::Certificate` if the certificate cannot be parsed, the
/// subject is empty, or an attribute value is not a string type.
pub fn canonical_subject_dn(der: &[u8]) -> Result<String> {
    let cert = parse_certificate(der)?;
    canonical_subject(&cert)
}

/// Canonicalise a DN given in its RFC 4514 string form.
///
/// Accepts `,` or `;` between RDNs, `+` inside multi-valued RDNs, backslash
/// escapes (including `\2C` hex pairs) and double-quoted values.
///
/// # Errors
///
/// Returns `Error::Certificate` if the DN is empty or an attribute lacks `=`.
pub fn canonicalize_dn(dn: &str) -> Result<String> {
    let mut attributes = Vec::new();
    for component in split_unescaped(dn, &[',', ';', '+']) {
        if component.trim().is_empty() {
            continue;
        }
        let (kind, value) = split_type_value(&component)
            .ok_or_else(|| Error::Certificate(format!("Malformed DN component '{component}'")))?;
        attributes.push(Attribute::new(&kind, &unescape_value(&value)));
    }
    render(attributes)
}

// ─────────────────────────────────────────────────────────────────────────────
// Certificate helpers
// ─────────────────────────────────────────────────────────────────────────────

fn parse_certificate(der: &[u8]) -> Result<X509Certificate<'_>> {
    let (_, cert) = X509Certificate::from_der(der)
        .map_err(|e| Error::Certificate(format!("Failed to parse certificate: {e}")))?;
    Ok(cert)
}

fn canonical_subject(cert: &X509Certificate<'_>) -> Result<String> {
    let mut attributes = Vec::new();
    for rdn in cert.subject().iter() {
        for attr in rdn.iter() {
            let oid = attr.attr_type().to_id_string();
            let value = attr.as_str().map_err(|e| {
                Error::Certificate(format!("Subject attribute {oid} is not a string: {e}"))
            })?;
            attributes.push(Attribute::new(&oid, value));
        }
    }
    render(attributes)
}

// ─────────────────────────────────────────────────────────────────────────────
// Normalisation
// ─────────────────────────────────────────────────────────────────────────────

#[derive(Debug, PartialEq, Eq, PartialOrd, Ord)]
struct Attribute {
    kind: String,
    value: String,
}

impl Attribute {
    fn new(kind: &str, value: &str) -> Self {
        Self {
            kind: normalize_type(kind),
            value: normalize_value(value),
        }
    }
}

fn render(mut attributes: Vec<Attribute>) -> Result<String> {
    if attributes.is_empty() {
        return Err(Error::Certificate("Empty distinguished name".to_string()));
    }
    attributes.sort();
    Ok(attributes
        .iter()
        .map(|a| format!("{}={}", a.kind, escape_value(&a.value)))
        .collect::<Vec<_>>()
        .join(","))
}

/// Short names for the attribute OIDs seen in practice.
const KNOWN_TYPES: &[(&str, &str)] = &[
    ("2.5.4.3", "CN"),
    ("2.5.4.5", "SERIALNUMBER"),
    ("2.5.4.6", "C"),
    ("2.5.4.7", "L"),
    ("2.5.4.8", "ST"),
    ("2.5.4.9", "STREET"),
    ("2.5.4.10", "O"),
    ("2.5.4.11", "OU"),
    ("0.9.2342.19200300.100.1.1", "UID"),
    ("0.9.2342.19200300.100.1.25", "DC"),
    ("1.2.840.113549.1.9.1", "EMAILADDRESS"),
];

fn normalize_type(kind: &str) -> String {
    let trimmed = kind.trim();
    let trimmed = trimmed
        .strip_prefix("OID.")
        .or_else(|| trimmed.strip_prefix("oid."))
        .unwrap_or(trimmed);
    let upper = trimmed.to_ascii_uppercase();

    if let Some((_, short)) = KNOWN_TYPES.iter().find(|(oid, _)| *oid == upper) {
        return (*short).to_string();
    }
    match upper.as_str() {
        "COMMONNAME" => "CN".to_string(),
        "E" => "EMAILADDRESS".to_string(),
        "S" => "ST".to_string(),
        _ => upper,
    }
}

fn normalize_value(value: &str) -> String {
    value
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

fn escape_value(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for c in value.chars() {
        if matches!(c, '\\' | ',' | '+' | '=' | '"' | '<' | '>' | ';') {
            out.push('\\');
        }
        out.push(c);
    }
    out
}

// ─────────────────────────────────────────────────────────────────────────────
// String DN parsing
// ─────────────────────────────────────────────────────────────────────────────

/// Split on any of `separators` that is neither escaped nor inside quotes.
/// Escape sequences are preserved in the output for later unescaping.
fn split_unescaped(input: &str, separators: &[char]) -> Vec<String> {
    let mut parts = Vec::new();
    let mut current = String::new();
    let mut chars = input.chars();
    let mut quoted = false;

    while let Some(c) = chars.next() {
        match c {
            '\\' => {
                current.push(c);
                if let Some(next) = chars.next() {
                    current.push(next);
                }
            }
            '"' => {
                quoted = !quoted;
                current.push(c);
            }
            c if !quoted && separators.contains(&c) => {
                parts.push(std::mem::take(&mut current));
            }
            _ => current.push(c),
        }
    }
    parts.push(current);
    parts
}

fn split_type_value(component: &str) -> Option<(String, String)> {
    let mut parts = split_unescaped(component, &['=']).into_iter();
    let kind = parts.next()?;
    let rest: Vec<String> = parts.collect();
    if rest.is_empty() || kind.trim().is_empty() {
        return None;
    }
    // Unescaped '=' inside the value is tolerated.
    Some((kind, rest.join("=")))
}

fn unescape_value(raw: &str) -> String {
    let trimmed = raw.trim();
    let inner = trimmed
        .strip_prefix('"')
        .and_then(|s| s.strip_suffix('"'))
        .unwrap_or(trimmed);

    let mut bytes = Vec::with_capacity(inner.len());
    let mut chars = inner.chars().peekable();
    while let Some(c) = chars.next() {
        if c != '\\' {
            let mut buf = [0u8; 4];
            bytes.extend_from_slice(c.encode_utf8(&mut buf).as_bytes());
            continue;
        }
        let Some(first) = chars.next() else {
            break;
        };
        let hex_pair = chars
            .peek()
            .filter(|_| first.is_ascii_hexdigit())
            .and_then(|second| second.to_digit(16))
            .zip(first.to_digit(16));
        if let Some((low, high)) = hex_pair {
            chars.next();
            // Two hex digits always fit in a byte.
            bytes.push(u8::try_from(high * 16 + low).unwrap_or(b'?'));
        } else {
            let mut buf = [0u8; 4];
            bytes.extend_from_slice(first.encode_utf8(&mut buf).as_bytes());
        }
    }
    String::from_utf8_lossy(&bytes).into_owned()
}

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────
