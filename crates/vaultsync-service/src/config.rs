use anyhow::{anyhow, Result};
use clap::Args;
use std::path::PathBuf;
use std::time::Duration;
use vaultsync_core::channel::DEFAULT_SNAPSHOT_TIMEOUT;
use vaultsync_core::paths;
use zeroize::Zeroizing;

const MIN_PASSWORD_LEN: usize = 12;

#[derive(Args, Debug, Clone, Default)]
pub struct ServiceArgs {
    /// Directory holding the state file, socket and IPC secret
    #[arg(long, global = true, env = "VAULTSYNC_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// How long a mirror waits for the background snapshot
    #[arg(long, global = true, env = "VAULTSYNC_SNAPSHOT_TIMEOUT_MS")]
    pub snapshot_timeout_ms: Option<u64>,

    #[arg(long, global = true, env = "VAULTSYNC_API_BASE_URL")]
    pub api_base_url: Option<String>,

    #[arg(long, global = true, env = "VAULTSYNC_API_TOKEN", hide_env_values = true)]
    pub api_token: Option<String>,
}

#[derive(Debug, Clone)]
pub struct ServiceConfig {
    pub data_dir: PathBuf,
    pub snapshot_timeout: Duration,
    pub api_base_url: Option<String>,
    pub api_token: Option<String>,
}

impl ServiceConfig {
    pub fn from_args(args: &ServiceArgs) -> Result<Self> {
        let data_dir = match &args.data_dir {
            Some(dir) => dir.clone(),
            None => paths::data_dir()?,
        };
        Ok(Self {
            data_dir,
            snapshot_timeout: args
                .snapshot_timeout_ms
                .map(Duration::from_millis)
                .unwrap_or(DEFAULT_SNAPSHOT_TIMEOUT),
            api_base_url: args
                .api_base_url
                .as_ref()
                .map(|url| url.trim_end_matches('/').to_string()),
            api_token: args.api_token.clone(),
        })
    }

    pub fn state_path(&self) -> PathBuf {
        paths::state_file(&self.data_dir)
    }

    pub fn socket_path(&self) -> PathBuf {
        paths::ipc_socket_path(&self.data_dir)
    }

    pub fn secret_path(&self) -> PathBuf {
        paths::ipc_secret_path(&self.data_dir)
    }

    pub fn api_base_url(&self) -> Result<&str> {
        self.api_base_url
            .as_deref()
            .ok_or_else(|| anyhow!("no API base URL; set --api-base-url or VAULTSYNC_API_BASE_URL"))
    }
}

pub fn prompt_password_once(prompt: &str) -> Result<Zeroizing<String>> {
    if let Ok(pw) = std::env::var("VAULTSYNC_PASSWORD") {
        if !pw.is_empty() {
            return Ok(Zeroizing::new(pw));
        }
    }
    let pw = rpassword::prompt_password(prompt).map_err(|e| anyhow!("password prompt: {e}"))?;
    Ok(Zeroizing::new(pw))
}

pub fn prompt_password_twice(prompt: &str) -> Result<Zeroizing<String>> {
    if let Ok(pw) = std::env::var("VAULTSYNC_PASSWORD") {
        if !pw.is_empty() {
            check_strength(&pw)?;
            return Ok(Zeroizing::new(pw));
        }
    }
    let first = prompt_password_once(prompt)?;
    check_strength(&first)?;
    let second = Zeroizing::new(
        rpassword::prompt_password("Confirm password").map_err(|e| anyhow!("password prompt: {e}"))?,
    );
    if first != second {
        return Err(anyhow!("passwords do not match"));
    }
    Ok(first)
}

fn check_strength(password: &str) -> Result<()> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(anyhow!("password too short; minimum {MIN_PASSWORD_LEN} characters"));
    }
    Ok(())
}
