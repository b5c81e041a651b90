use time::OffsetDateTime;
use x509_parser::prelude::{FromDer, X509Certificate};

/// Subject common name of a DER certificate.
///
/// Returns `None` when the certificate does not parse or carries no CN. An empty CN
/// attribute is reported as `Some("")`; callers decide whether that is acceptable.
pub fn subject_common_name(der: &[u8]) -> Option<String> {
    let (_, cert) = X509Certificate::from_der(der).ok()?;
    let cn = cert.subject().iter_common_name().next()?;
    cn.as_str().ok().map(str::to_owned)
}

pub fn certificate_not_after(der: &[u8]) -> Option<OffsetDateTime> {
    let (_, cert) = X509Certificate::from_der(der).ok()?;
    Some(cert.validity().not_after.to_datetime())
}
