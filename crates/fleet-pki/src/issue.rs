use crate::error::{PkiError, Result};
use crate::root::{BACKDATE, RootAuthority};
use rcgen::{
    CertificateParams, CertificateSigningRequestParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, PKCS_ECDSA_P384_SHA384,
    SerialNumber,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::time::Duration;
use time::OffsetDateTime;
use uuid::Uuid;

/// Which side of a mutually authenticated connection a leaf is good for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeafRole {
    Server,
    Client,
}

impl LeafRole {
    fn usage(self) -> ExtendedKeyUsagePurpose {
        match self {
            LeafRole::Server => ExtendedKeyUsagePurpose::ServerAuth,
            LeafRole::Client => ExtendedKeyUsagePurpose::ClientAuth,
        }
    }
}

/// A freshly issued leaf and its private key. Never persisted by this crate.
#[derive(Debug)]
pub struct IssuedCertificate {
    pub cert_der: CertificateDer<'static>,
    pub cert_pem: String,
    pub key_der: PrivatePkcs8KeyDer<'static>,
    pub key_pem: String,
    pub not_after: OffsetDateTime,
}

impl IssuedCertificate {
    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(self.key_der.clone_key())
    }
}

impl RootAuthority {
    /// Leaf for a service endpoint; `subject_name` becomes the CN and the only SAN.
    pub fn issue_server_certificate(&self, subject_name: &str) -> Result<IssuedCertificate> {
        self.issue(LeafRole::Server, subject_name, crate::DEFAULT_LEAF_VALIDITY)
    }

    /// Leaf for a node; the CN carries the node identity.
    pub fn issue_client_certificate(&self, subject_name: &str) -> Result<IssuedCertificate> {
        self.issue(LeafRole::Client, subject_name, crate::DEFAULT_LEAF_VALIDITY)
    }

    /// Issue a leaf with a fresh P-384 key.
    ///
    /// The validity window starts slightly in the past and never outlives the root.
    /// Client leaves carry no SAN; an empty `subject_name` produces a certificate with
    /// no CN at all.
    pub fn issue(
        &self,
        role: LeafRole,
        subject_name: &str,
        validity: Duration,
    ) -> Result<IssuedCertificate> {
        let key = KeyPair::generate_for(&PKCS_ECDSA_P384_SHA384)?;
        let mut params = match role {
            LeafRole::Server => {
                if subject_name.is_empty() {
                    return Err(PkiError::InvalidRequest(
                        "server certificates need a subject name".to_string(),
                    ));
                }
                CertificateParams::new(vec![subject_name.to_string()])?
            }
            LeafRole::Client => CertificateParams::default(),
        };
        params.distinguished_name = leaf_name(subject_name);
        self.apply_leaf_profile(&mut params, role, validity)?;

        let not_after = params.not_after;
        let (issuer, issuer_key) = self.signer();
        let cert = params.signed_by(&key, issuer, issuer_key)?;
        tracing::debug!(
            subject = subject_name,
            ?role,
            not_after = %not_after,
            "issued leaf certificate"
        );
        Ok(IssuedCertificate {
            cert_der: cert.der().clone(),
            cert_pem: cert.pem(),
            key_der: PrivatePkcs8KeyDer::from(key.serialize_der()),
            key_pem: key.serialize_pem(),
            not_after,
        })
    }

    /// Sign a PEM PKCS#10 request from a node that holds its own key.
    ///
    /// Only the requested public key is honored: the subject is replaced by
    /// `subject_name`, requested SANs and extensions are dropped, and the result is a
    /// client leaf.
    pub fn sign_csr(
        &self,
        csr_pem: &str,
        subject_name: &str,
        validity: Duration,
    ) -> Result<CertificateDer<'static>> {
        let mut csr = CertificateSigningRequestParams::from_pem(csr_pem)
            .map_err(|err| PkiError::InvalidRequest(err.to_string()))?;
        let mut params = CertificateParams::default();
        params.distinguished_name = leaf_name(subject_name);
        self.apply_leaf_profile(&mut params, LeafRole::Client, validity)?;
        csr.params = params;

        let (issuer, issuer_key) = self.signer();
        let cert = csr.signed_by(issuer, issuer_key)?;
        tracing::debug!(subject = subject_name, "signed certificate request");
        Ok(cert.der().clone())
    }

    fn apply_leaf_profile(
        &self,
        params: &mut CertificateParams,
        role: LeafRole,
        validity: Duration,
    ) -> Result<()> {
        let now = OffsetDateTime::now_utc();
        if self.not_after() <= now {
            return Err(PkiError::RootExpired(self.not_after()));
        }
        let requested = time::Duration::try_from(validity)
            .map_err(|err| PkiError::InvalidRequest(err.to_string()))?;
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![KeyUsagePurpose::DigitalSignature];
        params.extended_key_usages = vec![role.usage()];
        params.serial_number = Some(random_serial());
        params.not_before = now - BACKDATE;
        params.not_after = now
            .checked_add(requested)
            .map_or(self.not_after(), |end| end.min(self.not_after()));
        Ok(())
    }
}

fn leaf_name(subject_name: &str) -> DistinguishedName {
    let mut name = DistinguishedName::new();
    if !subject_name.is_empty() {
        name.push(DnType::CommonName, subject_name);
    }
    name
}

pub(crate) fn random_serial() -> SerialNumber {
    SerialNumber::from(Uuid::new_v4().as_u128() as u64)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{certificate_not_after, subject_common_name};

    fn fresh_root() -> (tempfile::TempDir, RootAuthority) {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = RootAuthority::bootstrap(dir.path()).expect("bootstrap");
        (dir, root)
    }

    #[test]
    fn server_leaf_carries_name_and_role() {
        let (_dir, root) = fresh_root();
        let leaf = root
            .issue_server_certificate("nfd-master.openness")
            .expect("issue");
        assert_eq!(
            subject_common_name(&leaf.cert_der).as_deref(),
            Some("nfd-master.openness")
        );
        assert!(leaf.key_pem.contains("BEGIN PRIVATE KEY"));
        assert!(leaf.cert_pem.contains("BEGIN CERTIFICATE"));
    }

    #[test]
    fn client_leaf_without_subject_has_no_cn() {
        let (_dir, root) = fresh_root();
        let leaf = root.issue_client_certificate("").expect("issue");
        assert_eq!(subject_common_name(&leaf.cert_der), None);
    }

    #[test]
    fn server_leaf_requires_subject() {
        let (_dir, root) = fresh_root();
        let err = root.issue_server_certificate("").unwrap_err();
        assert!(matches!(err, PkiError::InvalidRequest(_)));
    }

    #[test]
    fn leaf_validity_is_clamped_to_root() {
        let (_dir, root) = fresh_root();
        let leaf = root
            .issue(
                LeafRole::Client,
                "node-1",
                Duration::from_secs(20 * 365 * 24 * 60 * 60),
            )
            .expect("issue");
        let not_after = certificate_not_after(&leaf.cert_der).expect("not after");
        assert!(not_after <= root.not_after());
    }

    #[test]
    fn reported_expiry_matches_signed_certificate() {
        let (_dir, root) = fresh_root();
        let leaf = root
            .issue(LeafRole::Server, "nfd-master.test", Duration::from_secs(3600))
            .expect("issue");
        let signed = certificate_not_after(&leaf.cert_der).expect("not after");
        assert_eq!(leaf.not_after.unix_timestamp(), signed.unix_timestamp());
    }

    #[test]
    fn default_leaf_validity_is_ninety_days() {
        let (_dir, root) = fresh_root();
        let leaf = root.issue_client_certificate("node-1").expect("issue");
        let left = leaf.not_after - OffsetDateTime::now_utc();
        assert!(left <= time::Duration::days(90));
        assert!(left > time::Duration::days(89));
    }

    #[test]
    fn csr_subject_is_forced() {
        let (_dir, root) = fresh_root();
        let node_key = KeyPair::generate_for(&PKCS_ECDSA_P384_SHA384).expect("key");
        let mut request = CertificateParams::new(vec!["evil.example".to_string()]).expect("params");
        request.distinguished_name = leaf_name("admin");
        let csr = request.serialize_request(&node_key).expect("csr");
        let csr_pem = csr.pem().expect("csr pem");

        let cert = root
            .sign_csr(&csr_pem, "node-42", crate::DEFAULT_LEAF_VALIDITY)
            .expect("sign");
        assert_eq!(subject_common_name(&cert).as_deref(), Some("node-42"));
        root.verify_leaf(&cert, LeafRole::Client, None)
            .expect("csr leaf verifies as client");
    }

    #[test]
    fn malformed_csr_is_rejected() {
        let (_dir, root) = fresh_root();
        let err = root
            .sign_csr("garbage", "node-1", crate::DEFAULT_LEAF_VALIDITY)
            .unwrap_err();
        assert!(matches!(err, PkiError::InvalidRequest(_)));
    }
}
