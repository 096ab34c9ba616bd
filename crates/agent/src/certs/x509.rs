//! Certificate metadata extraction from PEM chains.

use chrono::{DateTime, Utc};
use x509_parser::extensions::GeneralName;
use x509_parser::prelude::{FromDer, X509Certificate};

use sitekeeper_common::{CertificateId, CertificateRecord, CertificateType};

use crate::state::{CertificateError, CertificateStore};

/// Build a metadata record from the leaf certificate of a PEM chain
///
/// The first `CERTIFICATE` block is taken as the leaf. Subjects are the DNS
/// subject alternative names, falling back to the subject common name.
pub fn parse_certificate(
    id: &CertificateId,
    cert_type: CertificateType,
    cert_pem: &[u8],
) -> Result<CertificateRecord, CertificateError> {
    let parse_err = |message: String| CertificateError::Parse {
        id: id.clone(),
        message,
    };

    let blocks = pem::parse_many(cert_pem).map_err(|e| parse_err(e.to_string()))?;
    let leaf = blocks
        .iter()
        .find(|block| block.tag() == "CERTIFICATE")
        .ok_or_else(|| parse_err("no CERTIFICATE block in PEM".to_string()))?;

    let (_, cert) = X509Certificate::from_der(leaf.contents())
        .map_err(|e| parse_err(format!("invalid X.509 certificate: {e}")))?;

    let validity = cert.validity();
    let not_before = timestamp(validity.not_before.timestamp())
        .ok_or_else(|| parse_err("notBefore out of range".to_string()))?;
    let not_after = timestamp(validity.not_after.timestamp())
        .ok_or_else(|| parse_err("notAfter out of range".to_string()))?;

    let issuer_org = cert
        .issuer()
        .iter_organization()
        .next()
        .and_then(|attr| attr.as_str().ok())
        .map(str::to_string);

    Ok(CertificateRecord {
        id: id.clone(),
        cert_type,
        not_before,
        not_after,
        issuer_org,
        subjects: subjects(&cert),
    })
}

fn timestamp(secs: i64) -> Option<DateTime<Utc>> {
    DateTime::from_timestamp(secs, 0)
}

fn subjects(cert: &X509Certificate<'_>) -> Vec<String> {
    let mut names: Vec<String> = match cert.subject_alternative_name() {
        Ok(Some(san)) => san
            .value
            .general_names
            .iter()
            .filter_map(|name| match name {
                GeneralName::DNSName(dns) => Some(dns.to_string()),
                _ => None,
            })
            .collect(),
        _ => Vec::new(),
    };

    if names.is_empty() {
        names.extend(
            cert.subject()
                .iter_common_name()
                .filter_map(|cn| cn.as_str().ok())
                .map(str::to_string),
        );
    }
    names
}

/// Store an operator-supplied certificate under a fresh ID
///
/// The chain is parsed first; nothing is written if it is unreadable or the
/// key is missing.
pub async fn import_certificate(
    store: &CertificateStore,
    key_pem: &[u8],
    cert_pem: &[u8],
) -> Result<CertificateRecord, CertificateError> {
    let id = CertificateId::generate();
    if key_pem.is_empty() {
        return Err(CertificateError::Parse {
            id,
            message: "private key is empty".to_string(),
        });
    }

    let record = parse_certificate(&id, CertificateType::Imported, cert_pem)?;
    store.put_certificate(&record, key_pem, cert_pem).await?;
    Ok(record)
}
