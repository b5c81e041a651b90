// Node identity taken from a verified client certificate.
use crate::error::SetLabelsError;
use fleet_pki::CertificateDer;

/// Common name on the leaf of a chain the handshake already verified.
///
/// `None` means the peer presented no certificate at all.
pub fn peer_node_name(chain: Option<&[CertificateDer<'_>]>) -> Result<String, SetLabelsError> {
    let leaf = chain.and_then(|chain| chain.first()).ok_or_else(|| {
        SetLabelsError::Unauthenticated("peer presented no client certificate".to_string())
    })?;
    match fleet_pki::subject_common_name(leaf) {
        Some(name) if !name.is_empty() => Ok(name),
        _ => Err(SetLabelsError::Unauthenticated(
            "peer connected with a client certificate with no common name".to_string(),
        )),
    }
}
