use x509_parser::extensions::GeneralName;
use x509_parser::parse_x509_certificate;

use crate::authz::AuthzError;

/// Roles carried by a DER-encoded certificate: the DNS names of its subject
/// alternative name extension. A certificate without the extension has no
/// roles.
pub fn roles_from_certificate(der: &[u8]) -> Result<Vec<String>, AuthzError> {
    let (_, cert) = parse_x509_certificate(der)
        .map_err(|e| AuthzError::InvalidCertificate(e.to_string()))?;

    let san = cert
        .subject_alternative_name()
        .map_err(|e| AuthzError::InvalidCertificate(e.to_string()))?;

    let roles = san
        .map(|ext| {
            ext.value
                .general_names
                .iter()
                .filter_map(|name| match name {
                    GeneralName::DNSName(dns) => Some(dns.to_string()),
                    _ => None,
                })
                .collect()
        })
        .unwrap_or_default();

    Ok(roles)
}
