//! Key, CSR and certificate handling
//!
//! kube-csr never signs anything: it generates an RSA key pair and a CSR
//! locally, hands the CSR to the cluster authority, and later only reads the
//! expiry of the certificate it got back.

pub mod pem_file;

use std::collections::HashSet;
use std::net::IpAddr;

use chrono::{DateTime, Utc};
use rcgen::{
    string::Ia5String, CertificateParams, DistinguishedName, DnType, DnValue, KeyPair,
    RsaKeySize, SanType, PKCS_RSA_SHA256,
};
use x509_parser::prelude::*;

use crate::{Error, Result};

pub use pem_file::{ensure_writable, read_file, read_pem_file, write_file, write_pem_file};

/// PEM label of the PKCS#8 private key file
pub const PRIVATE_KEY_LABEL: &str = "PRIVATE KEY";

/// PEM label of a PKCS#1 RSA private key, accepted when loading a key
pub const RSA_PRIVATE_KEY_LABEL: &str = "RSA PRIVATE KEY";

/// PEM label of the CSR file
pub const CSR_LABEL: &str = "CERTIFICATE REQUEST";

/// PEM label of the certificate file
pub const CERTIFICATE_LABEL: &str = "CERTIFICATE";

/// Hosts split by kind, each list deduplicated and sorted
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CategorizedHosts {
    /// DNS names, sorted lexicographically
    pub dns_names: Vec<String>,
    /// IP literals, sorted by their canonical string form
    pub ip_addresses: Vec<IpAddr>,
}

impl CategorizedHosts {
    /// Total number of hosts
    pub fn len(&self) -> usize {
        self.dns_names.len() + self.ip_addresses.len()
    }

    /// Whether there are no hosts
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Whether `host` is a dotted DNS name made of LDH labels
///
/// The first label may be a `*` wildcard.
pub fn is_dns_name(host: &str) -> bool {
    if host.len() > 253 || !host.contains('.') {
        return false;
    }
    host.split('.').enumerate().all(|(i, label)| {
        (i == 0 && label == "*")
            || (!label.is_empty()
                && label.len() <= 63
                && !label.starts_with('-')
                && !label.ends_with('-')
                && label.bytes().all(|b| b.is_ascii_alphanumeric() || b == b'-'))
    })
}

/// Split hosts into DNS names and IP literals
///
/// A host is an IP if it parses as one, a DNS name if [`is_dns_name`] accepts
/// it, and invalid otherwise. Every invalid host is reported in a single error.
pub fn categorize_hosts<S: AsRef<str>>(hosts: &[S]) -> Result<CategorizedHosts> {
    let mut seen = HashSet::new();
    let mut categorized = CategorizedHosts::default();
    let mut invalid = Vec::new();

    for host in hosts.iter().map(AsRef::as_ref) {
        if !seen.insert(host) {
            continue;
        }
        if let Ok(ip) = host.parse::<IpAddr>() {
            categorized.ip_addresses.push(ip);
        } else if is_dns_name(host) {
            categorized.dns_names.push(host.to_string());
        } else {
            invalid.push(host);
        }
    }

    if !invalid.is_empty() {
        return Err(Error::validation(format!(
            "cannot categorize given hosts: {}",
            invalid.join(", ")
        )));
    }

    categorized.dns_names.sort();
    categorized.ip_addresses.sort_by_key(|ip| ip.to_string());
    Ok(categorized)
}

/// Read a private key file and return it as PKCS#8 DER
///
/// Both `PRIVATE KEY` (PKCS#8) and `RSA PRIVATE KEY` (PKCS#1) blocks are
/// accepted. A PKCS#1 key is wrapped into PKCS#8.
pub async fn read_private_key(path: &std::path::Path) -> Result<Vec<u8>> {
    let raw = read_file(path).await?;
    let block = ::pem::parse(&raw)
        .map_err(|e| Error::pki(format!("failed to parse PEM {}: {e}", path.display())))?;
    match block.tag() {
        PRIVATE_KEY_LABEL => Ok(block.into_contents()),
        RSA_PRIVATE_KEY_LABEL => Ok(pkcs1_to_pkcs8(block.contents())),
        other => Err(Error::pki(format!(
            "unexpected PEM block {other} in {}, expected {PRIVATE_KEY_LABEL} or {RSA_PRIVATE_KEY_LABEL}",
            path.display()
        ))),
    }
}

/// AlgorithmIdentifier for rsaEncryption (1.2.840.113549.1.1.1) with NULL parameters
const RSA_ALGORITHM_IDENTIFIER: [u8; 15] = [
    0x30, 0x0d, 0x06, 0x09, 0x2a, 0x86, 0x48, 0x86, 0xf7, 0x0d, 0x01, 0x01, 0x01, 0x05, 0x00,
];

fn der_header(tag: u8, len: usize) -> Vec<u8> {
    let mut header = vec![tag];
    if len < 0x80 {
        header.push(len as u8);
    } else {
        let bytes: Vec<u8> = len
            .to_be_bytes()
            .into_iter()
            .skip_while(|b| *b == 0)
            .collect();
        header.push(0x80 | bytes.len() as u8);
        header.extend(bytes);
    }
    header
}

/// Wrap a PKCS#1 RSAPrivateKey into a PKCS#8 PrivateKeyInfo
fn pkcs1_to_pkcs8(pkcs1: &[u8]) -> Vec<u8> {
    let mut body = vec![0x02, 0x01, 0x00];
    body.extend_from_slice(&RSA_ALGORITHM_IDENTIFIER);
    body.extend(der_header(0x04, pkcs1.len()));
    body.extend_from_slice(pkcs1);

    let mut info = der_header(0x30, body.len());
    info.extend(body);
    info
}

/// RSA key sizes accepted for generated keys
pub const SUPPORTED_KEY_BITS: [u32; 3] = [2048, 3072, 4096];

fn rsa_key_size(bits: u32) -> Result<RsaKeySize> {
    match bits {
        2048 => Ok(RsaKeySize::_2048),
        3072 => Ok(RsaKeySize::_3072),
        4096 => Ok(RsaKeySize::_4096),
        other => Err(Error::validation(format!(
            "unsupported RSA key size {other}, expected one of 2048, 3072, 4096"
        ))),
    }
}

/// Input for [`generate_key_and_csr`]
#[derive(Debug, Clone)]
pub struct CsrRequest<'a> {
    /// Subject common name, must not be empty
    pub common_name: &'a str,
    /// Subject alternative names
    pub hosts: &'a [String],
    /// RSA key size for a generated key
    pub key_bits: u32,
    /// DER-encoded PKCS#8 key to reuse instead of generating one
    pub existing_key: Option<&'a [u8]>,
}

/// A private key and the CSR it signed
#[derive(Debug, Clone)]
pub struct KeyAndCsr {
    /// DER-encoded PKCS#8 private key
    pub private_key_der: Vec<u8>,
    /// DER-encoded PKCS#10 CSR
    pub csr_der: Vec<u8>,
}

/// Generate (or reuse) an RSA key and a CSR for the given subject
///
/// Hosts are validated before any key material is produced.
pub fn generate_key_and_csr(request: &CsrRequest<'_>) -> Result<KeyAndCsr> {
    if request.common_name.is_empty() {
        return Err(Error::validation("empty common name"));
    }
    let hosts = categorize_hosts(request.hosts)?;

    let key_pair = match request.existing_key {
        Some(der) => KeyPair::try_from(der)
            .map_err(|e| Error::pki(format!("failed to load private key: {e}")))?,
        None => KeyPair::generate_rsa_for(&PKCS_RSA_SHA256, rsa_key_size(request.key_bits)?)
            .map_err(|e| Error::pki(format!("failed to generate private key: {e}")))?,
    };

    let mut params = CertificateParams::default();
    let mut dn = DistinguishedName::new();
    dn.push(
        DnType::CommonName,
        DnValue::Utf8String(request.common_name.to_string()),
    );
    params.distinguished_name = dn;

    for name in &hosts.dns_names {
        let name = Ia5String::try_from(name.as_str())
            .map_err(|e| Error::validation(format!("invalid DNS name {name}: {e}")))?;
        params.subject_alt_names.push(SanType::DnsName(name));
    }
    for ip in &hosts.ip_addresses {
        params.subject_alt_names.push(SanType::IpAddress(*ip));
    }

    let csr = params
        .serialize_request(&key_pair)
        .map_err(|e| Error::pki(format!("failed to create CSR: {e}")))?;

    Ok(KeyAndCsr {
        private_key_der: key_pair.serialize_der(),
        csr_der: csr.der().to_vec(),
    })
}

/// Validity window and subject of a certificate
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CertificateInfo {
    /// Subject distinguished name
    pub subject: String,
    /// Start of validity
    pub not_before: DateTime<Utc>,
    /// End of validity
    pub not_after: DateTime<Utc>,
}

impl CertificateInfo {
    /// Parse the first certificate of a PEM bundle
    pub fn from_pem(pem_data: &[u8]) -> Result<Self> {
        let block = ::pem::parse(pem_data)
            .map_err(|e| Error::pki(format!("failed to parse PEM: {e}")))?;
        if block.tag() != CERTIFICATE_LABEL {
            return Err(Error::pki(format!(
                "expected {CERTIFICATE_LABEL} PEM block, got {}",
                block.tag()
            )));
        }
        Self::from_der(block.contents())
    }

    /// Parse a DER certificate
    pub fn from_der(der: &[u8]) -> Result<Self> {
        let (_, cert) = X509Certificate::from_der(der)
            .map_err(|e| Error::pki(format!("failed to parse certificate: {e}")))?;
        let validity = cert.validity();
        Ok(Self {
            subject: cert.subject().to_string(),
            not_before: timestamp(validity.not_before.timestamp())?,
            not_after: timestamp(validity.not_after.timestamp())?,
        })
    }

    /// Time left until `notAfter`, negative once expired
    pub fn time_left(&self, now: DateTime<Utc>) -> chrono::Duration {
        self.not_after - now
    }
}

fn timestamp(secs: i64) -> Result<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
        .ok_or_else(|| Error::pki(format!("certificate time {secs} out of range")))
}

/// Self-signed certificate valid until `not_after`, for tests
#[cfg(test)]
pub(crate) fn self_signed_pem(common_name: &str, not_after: DateTime<Utc>) -> Vec<u8> {
    let key = KeyPair::generate().unwrap();
    let mut params = CertificateParams::new(vec![format!("{common_name}.example.com")]).unwrap();
    params
        .distinguished_name
        .push(DnType::CommonName, common_name);
    let epoch = rcgen::date_time_ymd(1970, 1, 1);
    let secs = |t: DateTime<Utc>| std::time::Duration::from_secs(t.timestamp() as u64);
    params.not_before = epoch + secs(not_after - chrono::Duration::days(30));
    params.not_after = epoch + secs(not_after);
    params.self_signed(&key).unwrap().pem().into_bytes()
}
