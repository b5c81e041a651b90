use std::path::PathBuf;
use thiserror::Error;

pub type Result<T> = std::result::Result<T, PkiError>;

/// Failures while loading, creating, or using the root authority.
///
/// `Read`, `Decode`, `KeyMismatch`, and `NotCa` are load failures and are fatal at
/// service startup. `Write` covers bootstrap I/O. Neither class is retried.
#[derive(Debug, Error)]
pub enum PkiError {
    #[error("unable to read {}: {source}", path.display())]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("unable to decode {}: {reason}", path.display())]
    Decode { path: PathBuf, reason: String },
    #[error(
        "key {} does not match the public key of certificate {}",
        key_path.display(),
        cert_path.display()
    )]
    KeyMismatch {
        cert_path: PathBuf,
        key_path: PathBuf,
    },
    #[error("certificate {} is not a CA certificate", path.display())]
    NotCa { path: PathBuf },
    #[error("unable to write {}: {source}", path.display())]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("root authority expired at {0}")]
    RootExpired(time::OffsetDateTime),
    #[error("invalid certificate request: {0}")]
    InvalidRequest(String),
    #[error("certificate rejected: {0}")]
    Untrusted(String),
    #[error("certificate generation failed: {0}")]
    Generate(#[from] rcgen::Error),
}

impl PkiError {
    /// True for the failures that mean "the credentials on disk are unusable".
    pub fn is_load_error(&self) -> bool {
        matches!(
            self,
            PkiError::Read { .. }
                | PkiError::Decode { .. }
                | PkiError::KeyMismatch { .. }
                | PkiError::NotCa { .. }
        )
    }

    pub(crate) fn decode(path: impl Into<PathBuf>, reason: impl ToString) -> Self {
        PkiError::Decode {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}
