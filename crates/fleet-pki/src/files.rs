// PEM file helpers. Everything written here is owner-only on Unix.
use crate::error::{PkiError, Result};
use std::fs;
use std::io::Write;
use std::path::Path;

pub(crate) fn read_to_string(path: &Path) -> Result<String> {
    fs::read_to_string(path).map_err(|source| PkiError::Read {
        path: path.to_path_buf(),
        source,
    })
}

/// Create `dir` (and parents) if needed, restricting the leaf directory to its owner.
pub(crate) fn ensure_private_dir(dir: &Path) -> Result<()> {
    let write_err = |source| PkiError::Write {
        path: dir.to_path_buf(),
        source,
    };
    fs::create_dir_all(dir).map_err(write_err)?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(dir, fs::Permissions::from_mode(0o700)).map_err(write_err)?;
    }
    Ok(())
}

/// Write `contents` to `path`, truncating any previous file, with mode 0600.
pub(crate) fn write_private(path: &Path, contents: &str) -> Result<()> {
    let write_err = |source| PkiError::Write {
        path: path.to_path_buf(),
        source,
    };
    let mut options = fs::OpenOptions::new();
    options.write(true).create(true).truncate(true);
    #[cfg(unix)]
    {
        use std::os::unix::fs::OpenOptionsExt;
        options.mode(0o600);
    }
    let mut file = options.open(path).map_err(write_err)?;
    file.write_all(contents.as_bytes()).map_err(write_err)?;
    file.sync_all().map_err(write_err)?;
    // `mode` only applies on create; tighten files that already existed.
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600)).map_err(write_err)?;
    }
    Ok(())
}
