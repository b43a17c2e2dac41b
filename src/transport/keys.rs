//! Private key checks performed before connecting.
//!
//! Transports reject world-readable keys with opaque messages, so the engine
//! inspects permissions itself and fails fast with
//! [`TransportError::InsecureKeyPermissions`].

use camino::Utf8Path;
use tracing::{debug, info};

use super::TransportError;

/// Verifies that `path` exists and is only accessible by its owner.
///
/// When `repair` is set, loose permissions are tightened to `0600` once before
/// giving up. Non-Unix platforms only check that the file exists.
///
/// # Errors
///
/// Returns [`TransportError::KeyUnreadable`] when the file cannot be
/// inspected and [`TransportError::InsecureKeyPermissions`] when group or
/// other bits remain set.
pub fn verify_key_permissions(path: &Utf8Path, repair: bool) -> Result<(), TransportError> {
    debug!(key = %path, "checking key permissions");
    let metadata = std::fs::metadata(path).map_err(|err| TransportError::KeyUnreadable {
        path: path.to_path_buf(),
        message: err.to_string(),
    })?;
    if !metadata.is_file() {
        return Err(TransportError::KeyUnreadable {
            path: path.to_path_buf(),
            message: String::from("not a regular file"),
        });
    }
    check_mode(path, &metadata, repair)
}

#[cfg(unix)]
fn check_mode(
    path: &Utf8Path,
    metadata: &std::fs::Metadata,
    repair: bool,
) -> Result<(), TransportError> {
    use std::os::unix::fs::PermissionsExt;

    let mode = metadata.permissions().mode() & 0o777;
    if mode & 0o077 == 0 {
        return Ok(());
    }
    if !repair {
        return Err(TransportError::InsecureKeyPermissions {
            path: path.to_path_buf(),
            mode,
        });
    }

    info!(key = %path, mode = format!("{mode:o}"), "tightening key permissions to 0600");
    let insecure = || TransportError::InsecureKeyPermissions {
        path: path.to_path_buf(),
        mode,
    };
    std::fs::set_permissions(path, std::fs::Permissions::from_mode(0o600))
        .map_err(|_| insecure())?;
    let repaired = std::fs::metadata(path)
        .map_err(|_| insecure())?
        .permissions()
        .mode()
        & 0o777;
    if repaired & 0o077 == 0 {
        Ok(())
    } else {
        Err(TransportError::InsecureKeyPermissions {
            path: path.to_path_buf(),
            mode: repaired,
        })
    }
}

#[cfg(not(unix))]
fn check_mode(
    _path: &Utf8Path,
    _metadata: &std::fs::Metadata,
    _repair: bool,
) -> Result<(), TransportError> {
    Ok(())
}
