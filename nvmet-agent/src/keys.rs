//! DH-CHAP key material on disk.
//!
//! Secrets are written into a dedicated directory (`/var/run/spdk/keys` by
//! default) and registered with the daemon's keyring by path. The directory
//! is owned by this agent; files are created 0600 and the directory 0700.

use std::fmt::{self, Display};
use std::fs::{self, DirBuilder, Permissions};
use std::io::{self, Write};
use std::os::unix::fs::{DirBuilderExt, PermissionsExt};
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{NvmetError, Result};

/// Default directory for key files.
pub const DEFAULT_KEY_DIR: &str = "/var/run/spdk/keys";

/// Which DH-CHAP secret of a host a keyring entry holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum KeyRole {
    /// Host authenticates to the controller.
    Host,
    /// Controller authenticates back to the host.
    Ctrl,
}

impl KeyRole {
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyRole::Host => "dhchap_key",
            KeyRole::Ctrl => "dhchap_ctrl_key",
        }
    }

    /// Prefix shared by every keyring name of this role.
    pub fn name_prefix(&self) -> String {
        format!("{}-", self.as_str())
    }
}

impl Display for KeyRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Keyring name for a host secret: `{role}-{hostnqn}-{md5(secret)}` with the
/// NQN's colons replaced by dashes. A changed secret yields a new name.
pub fn key_name(role: KeyRole, hostnqn: &str, secret: &str) -> String {
    format!(
        "{}-{}-{:x}",
        role.as_str(),
        hostnqn.replace(':', "-"),
        md5::compute(secret.as_bytes())
    )
}

#[derive(Debug, Clone)]
pub struct KeyStore {
    dir: PathBuf,
}

impl Default for KeyStore {
    fn default() -> Self {
        Self::new(DEFAULT_KEY_DIR)
    }
}

impl KeyStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn key_error(path: &Path, source: io::Error) -> NvmetError {
        NvmetError::KeyMaterial {
            path: path.to_path_buf(),
            source,
        }
    }

    /// Create the key directory if needed and restrict it to the owner.
    pub fn ensure_dir(&self) -> Result<()> {
        DirBuilder::new()
            .recursive(true)
            .mode(0o700)
            .create(&self.dir)
            .map_err(|e| Self::key_error(&self.dir, e))?;
        fs::set_permissions(&self.dir, Permissions::from_mode(0o700))
            .map_err(|e| Self::key_error(&self.dir, e))
    }

    /// Write a secret to a new uniquely named file and return its path.
    pub fn write(&self, secret: &str) -> Result<PathBuf> {
        let mut file = tempfile::Builder::new()
            .prefix("key-")
            .permissions(Permissions::from_mode(0o600))
            .tempfile_in(&self.dir)
            .map_err(|e| Self::key_error(&self.dir, e))?;
        file.write_all(secret.as_bytes())
            .and_then(|()| file.as_file().sync_all())
            .map_err(|e| Self::key_error(file.path(), e))?;
        let (_, path) = file.keep().map_err(|e| Self::key_error(&self.dir, e.error))?;
        debug!("Wrote key file {}", path.display());
        Ok(path)
    }

    /// Remove a key file. Paths outside the key directory are left alone
    /// and a file that is already gone is not an error.
    pub fn remove(&self, path: &Path) -> Result<()> {
        if path.parent() != Some(self.dir.as_path()) {
            warn!(
                "Not removing key file {} outside {}",
                path.display(),
                self.dir.display()
            );
            return Ok(());
        }
        match fs::remove_file(path) {
            Ok(()) => {
                debug!("Removed key file {}", path.display());
                Ok(())
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Self::key_error(path, e)),
        }
    }
}
