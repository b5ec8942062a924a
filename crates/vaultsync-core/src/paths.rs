use directories::ProjectDirs;
use rand::RngCore;
use std::fs;
use std::path::{Path, PathBuf};
use tracing::info;

use crate::error::{Result, SessionError};

pub const APP_QUALIFIER: &str = "com";
pub const APP_ORG: &str = "vaultsync";
pub const APP_NAME: &str = "vaultsync";

const IPC_SECRET_LEN: usize = 32;

pub fn data_dir() -> Result<PathBuf> {
    let dirs = ProjectDirs::from(APP_QUALIFIER, APP_ORG, APP_NAME)
        .ok_or_else(|| SessionError::Storage("cannot determine data directory".to_string()))?;
    Ok(dirs.data_dir().to_path_buf())
}

pub fn state_file(data_dir: &Path) -> PathBuf {
    data_dir.join("state.json")
}

pub fn ipc_socket_path(data_dir: &Path) -> PathBuf {
    if let Ok(override_path) = std::env::var("VAULTSYNC_SOCKET") {
        return PathBuf::from(override_path);
    }
    data_dir.join("vaultsync.ipc")
}

pub fn ipc_secret_path(data_dir: &Path) -> PathBuf {
    data_dir.join("ipc.secret")
}

/// Reads the hex-encoded IPC secret, generating one on first use.
pub fn load_or_create_ipc_secret(path: &Path) -> Result<Vec<u8>> {
    if path.exists() {
        let encoded = fs::read_to_string(path)?;
        let secret = hex::decode(encoded.trim())
            .map_err(|e| SessionError::Storage(format!("ipc secret {}: {e}", path.display())))?;
        if secret.len() != IPC_SECRET_LEN {
            return Err(SessionError::Storage(format!(
                "ipc secret {} has wrong length",
                path.display()
            )));
        }
        return Ok(secret);
    }
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut secret = vec![0u8; IPC_SECRET_LEN];
    rand::thread_rng().fill_bytes(&mut secret);
    fs::write(path, hex::encode(&secret))?;
    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        fs::set_permissions(path, fs::Permissions::from_mode(0o600))?;
    }
    info!(path = %path.display(), "generated ipc secret");
    Ok(secret)
}
