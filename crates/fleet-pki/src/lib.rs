//! Root authority and leaf certificate issuance for the edge fleet.
//!
//! The root authority is a self-signed ECDSA P-256 certificate and its PKCS#8 key,
//! kept as `cert.pem` and `key.pem` in one directory. Leaves are ECDSA P-384 and carry
//! either the server-auth or the client-auth extended key usage.
//!
//! ```no_run
//! use fleet_pki::{LeafRole, RootAuthority};
//!
//! # fn main() -> fleet_pki::Result<()> {
//! let root = RootAuthority::init("/ca")?;
//! let server = root.issue_server_certificate("nfd-master.openness")?;
//! root.verify_leaf(&server.cert_der, LeafRole::Server, Some("nfd-master.openness"))?;
//! # Ok(())
//! # }
//! ```
mod error;
mod files;
mod inspect;
mod issue;
mod root;
mod verify;

pub use error::{PkiError, Result};
pub use inspect::{certificate_not_after, subject_common_name};
pub use issue::{IssuedCertificate, LeafRole};
pub use root::{RootAuthority, root_paths};
pub use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};

use std::time::Duration;

/// File name of the root certificate inside a credentials directory.
pub const ROOT_CERT_FILE: &str = "cert.pem";
/// File name of the root key inside a credentials directory.
pub const ROOT_KEY_FILE: &str = "key.pem";
/// Default validity of an issued leaf before clamping to the root's expiry.
pub const DEFAULT_LEAF_VALIDITY: Duration = Duration::from_secs(90 * 24 * 60 * 60);
