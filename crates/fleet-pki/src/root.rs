use crate::error::{PkiError, Result};
use crate::files;
use crate::{ROOT_CERT_FILE, ROOT_KEY_FILE};
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType, IsCa, KeyPair,
    KeyUsagePurpose, PKCS_ECDSA_P256_SHA256,
};
use rustls::pki_types::CertificateDer;
use std::fmt;
use std::path::{Path, PathBuf};
use time::{Duration, OffsetDateTime};
use x509_parser::prelude::{FromDer, X509Certificate};

pub(crate) const ROOT_COMMON_NAME: &str = "fleet root authority";
const ROOT_ORGANIZATION: &str = "edge fleet";
const ROOT_VALIDITY: Duration = Duration::days(3 * 365);
// Tolerates small clock skew between the CA host and its peers.
pub(crate) const BACKDATE: Duration = Duration::seconds(15);

/// A self-signed root certificate and the key that produced it.
///
/// Held for the whole process lifetime by anything that issues or verifies fleet
/// certificates. The stored certificate bytes are what peers trust; `signer` is the
/// rcgen view of the same subject and key, used only as the issuer of new leaves.
pub struct RootAuthority {
    cert_der: CertificateDer<'static>,
    cert_pem: String,
    key: KeyPair,
    signer: Certificate,
    not_after: OffsetDateTime,
}

impl fmt::Debug for RootAuthority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RootAuthority")
            .field("not_after", &self.not_after)
            .finish_non_exhaustive()
    }
}

impl RootAuthority {
    /// Load an existing authority. Every inconsistency is a load error.
    pub fn load(cert_path: impl AsRef<Path>, key_path: impl AsRef<Path>) -> Result<Self> {
        let cert_path = cert_path.as_ref();
        let key_path = key_path.as_ref();
        let key = load_key(key_path)?;
        let cert_pem = files::read_to_string(cert_path)?;
        let loaded = Self::from_parts(cert_path, key_path, cert_pem, key)?;
        tracing::info!(
            cert = %cert_path.display(),
            not_after = %loaded.not_after,
            "loaded root authority"
        );
        Ok(loaded)
    }

    /// Generate a fresh authority and write `cert.pem` and `key.pem` into `dir`.
    ///
    /// Existing files are overwritten; callers decide whether re-bootstrapping is allowed.
    pub fn bootstrap(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        files::ensure_private_dir(dir)?;
        let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
        files::write_private(&dir.join(ROOT_KEY_FILE), &key.serialize_pem())?;
        let authority = Self::self_sign(key)?;
        files::write_private(&dir.join(ROOT_CERT_FILE), &authority.cert_pem)?;
        tracing::info!(dir = %dir.display(), "bootstrapped root authority");
        Ok(authority)
    }

    /// Load the authority from `dir`, creating whatever is missing.
    ///
    /// A missing key is generated; a missing certificate, or one that was not produced
    /// from the stored key, is re-issued from the key. Files that exist but do not
    /// decode are still errors.
    pub fn init(dir: impl AsRef<Path>) -> Result<Self> {
        let dir = dir.as_ref();
        let key_path = dir.join(ROOT_KEY_FILE);
        let cert_path = dir.join(ROOT_CERT_FILE);
        files::ensure_private_dir(dir)?;

        let key = if key_path.exists() {
            load_key(&key_path)?
        } else {
            tracing::info!(path = %key_path.display(), "generating root key");
            let key = KeyPair::generate_for(&PKCS_ECDSA_P256_SHA256)?;
            files::write_private(&key_path, &key.serialize_pem())?;
            key
        };

        if cert_path.exists() {
            let cert_pem = files::read_to_string(&cert_path)?;
            match Self::from_parts(&cert_path, &key_path, cert_pem, key) {
                Ok(authority) => return Ok(authority),
                Err(PkiError::KeyMismatch { .. }) => {
                    tracing::warn!(
                        path = %cert_path.display(),
                        "root certificate does not match root key; re-issuing"
                    );
                }
                Err(err) => return Err(err),
            }
            // `from_parts` consumed the key on the mismatch path.
            let key = load_key(&key_path)?;
            return Self::write_fresh_cert(&cert_path, key);
        }

        tracing::info!(path = %cert_path.display(), "generating root certificate");
        Self::write_fresh_cert(&cert_path, key)
    }

    /// Issuing chain handed to peers; the root only, there are no intermediates.
    pub fn ca_chain(&self) -> Vec<CertificateDer<'static>> {
        vec![self.cert_der.clone()]
    }

    pub fn cert_der(&self) -> &CertificateDer<'static> {
        &self.cert_der
    }

    pub fn cert_pem(&self) -> &str {
        &self.cert_pem
    }

    pub fn not_after(&self) -> OffsetDateTime {
        self.not_after
    }

    pub(crate) fn signer(&self) -> (&Certificate, &KeyPair) {
        (&self.signer, &self.key)
    }

    fn write_fresh_cert(cert_path: &Path, key: KeyPair) -> Result<Self> {
        let authority = Self::self_sign(key)?;
        files::write_private(cert_path, &authority.cert_pem)?;
        Ok(authority)
    }

    fn self_sign(key: KeyPair) -> Result<Self> {
        let now = OffsetDateTime::now_utc();
        let mut params = CertificateParams::default();
        let mut name = DistinguishedName::new();
        name.push(DnType::OrganizationName, ROOT_ORGANIZATION);
        name.push(DnType::CommonName, ROOT_COMMON_NAME);
        params.distinguished_name = name;
        params.is_ca = IsCa::Ca(BasicConstraints::Constrained(0));
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.serial_number = Some(crate::issue::random_serial());
        params.not_before = now - BACKDATE;
        params.not_after = now + ROOT_VALIDITY;
        let not_after = params.not_after;

        let cert = params.self_signed(&key)?;
        Ok(Self {
            cert_der: cert.der().clone(),
            cert_pem: cert.pem(),
            key,
            signer: cert,
            not_after,
        })
    }

    fn from_parts(
        cert_path: &Path,
        key_path: &Path,
        cert_pem: String,
        key: KeyPair,
    ) -> Result<Self> {
        let (_, pem) = x509_parser::pem::parse_x509_pem(cert_pem.as_bytes())
            .map_err(|err| PkiError::decode(cert_path, err))?;
        if pem.label != "CERTIFICATE" {
            return Err(PkiError::decode(
                cert_path,
                format!("unexpected PEM block {}", pem.label),
            ));
        }
        let (_, x509) = X509Certificate::from_der(&pem.contents)
            .map_err(|err| PkiError::decode(cert_path, err))?;

        if x509.public_key().subject_public_key.data.as_ref() != key.public_key_raw() {
            return Err(PkiError::KeyMismatch {
                cert_path: cert_path.to_path_buf(),
                key_path: key_path.to_path_buf(),
            });
        }
        let is_ca = x509
            .basic_constraints()
            .map_err(|err| PkiError::decode(cert_path, err))?
            .is_some_and(|ext| ext.value.ca);
        if !is_ca {
            return Err(PkiError::NotCa {
                path: cert_path.to_path_buf(),
            });
        }
        let not_after = x509.validity().not_after.to_datetime();

        // Rebuild an rcgen issuer with the same subject and key; leaves only borrow its
        // name and signing key, never its bytes.
        let params = CertificateParams::from_ca_cert_pem(&cert_pem)
            .map_err(|err| PkiError::decode(cert_path, err))?;
        let signer = params.self_signed(&key)?;

        Ok(Self {
            cert_der: CertificateDer::from(pem.contents),
            cert_pem,
            key,
            signer,
            not_after,
        })
    }
}

fn load_key(path: &Path) -> Result<KeyPair> {
    let pem = files::read_to_string(path)?;
    KeyPair::from_pem(&pem).map_err(|err| PkiError::decode(path, err))
}

/// Paths of the root files inside a credentials directory.
pub fn root_paths(dir: impl AsRef<Path>) -> (PathBuf, PathBuf) {
    let dir = dir.as_ref();
    (dir.join(ROOT_CERT_FILE), dir.join(ROOT_KEY_FILE))
}
