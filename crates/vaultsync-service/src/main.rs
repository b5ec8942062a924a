use anyhow::{anyhow, Result};
use chrono::Utc;
use clap::{Parser, Subcommand};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;
use vaultsync_core::broker::SessionStateBroker;
use vaultsync_core::channel::{CrossContextChannel, LocalHub};
use vaultsync_core::durable_store::{DurableStateStore, FileStateStore};
use vaultsync_core::lock::{LockReason, LockStateMachine, LockStatus, LOCK_STATUS};
use vaultsync_core::migrations::MigrationRunner;
use vaultsync_core::rotation::{KeyRotationCoordinator, LocalItemsProvider, RewrapKeyWrapper};
use vaultsync_core::secret_store::{SecretEvent, SecretHandle, SecretStore};
use vaultsync_core::settings::TimeoutTrigger;
use vaultsync_core::unlock::{MasterPasswordVerifier, UnlockFactor};
use vaultsync_core::{paths, StateScope, UserId};

mod api_client;
mod config;

use crate::api_client::HttpRpcClient;
use crate::config::{prompt_password_once, prompt_password_twice, ServiceArgs, ServiceConfig};

const BACKGROUND_CONTEXT: &str = "background";
const LOCK_COMMAND_TOPIC: &str = "control:lock";

#[derive(Parser, Debug)]
#[command(author, version, about = "Vaultsync session state service", long_about = None)]
struct Cli {
    #[command(flatten)]
    args: ServiceArgs,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Create a user key for an account and wrap it under a master password
    InitAccount {
        #[arg(long)]
        user: String,
    },
    /// Run the background context that owns all session state
    Run {
        /// Accounts to unlock at startup
        #[arg(long)]
        unlock: Vec<String>,
        /// Seconds between vault timeout checks
        #[arg(long, default_value_t = 30)]
        tick_secs: u64,
    },
    /// Print an account's lock status
    Status {
        #[arg(long)]
        user: String,
    },
    /// Follow an account's lock status until interrupted
    Watch {
        #[arg(long)]
        user: String,
    },
    /// Ask the background context to lock an account
    Lock {
        #[arg(long)]
        user: String,
    },
    /// Rotate an account's user key; the background context must be stopped
    Rotate {
        #[arg(long)]
        user: String,
    },
}

#[derive(Debug, Serialize, Deserialize)]
struct LockCommand {
    user_id: UserId,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let cli = Cli::parse();
    let config = ServiceConfig::from_args(&cli.args)?;
    match cli.command {
        Commands::InitAccount { user } => init_account_command(&config, UserId::new(user)).await,
        Commands::Run { unlock, tick_secs } => run_command(&config, unlock, tick_secs).await,
        Commands::Status { user } => status_command(&config, UserId::new(user)).await,
        Commands::Watch { user } => watch_command(&config, UserId::new(user)).await,
        Commands::Lock { user } => lock_command(&config, UserId::new(user)).await,
        Commands::Rotate { user } => rotate_command(&config, UserId::new(user)).await,
    }
}

async fn open_store(config: &ServiceConfig) -> Result<Arc<dyn DurableStateStore>> {
    std::fs::create_dir_all(&config.data_dir)?;
    let store: Arc<dyn DurableStateStore> = Arc::new(FileStateStore::open(config.state_path())?);
    let version = MigrationRunner::default().run(store.clone()).await?;
    info!(version, path = %config.state_path().display(), "state store ready");
    Ok(store)
}

async fn init_account_command(config: &ServiceConfig, user_id: UserId) -> Result<()> {
    let store = open_store(config).await?;
    let verifier = MasterPasswordVerifier::new(store);
    if verifier.is_enrolled(&user_id).await {
        return Err(anyhow!("account {user_id} already has a master password"));
    }
    let password = prompt_password_twice("Create master password")?;
    let key = SecretHandle::generate(user_id.clone());
    verifier.enroll(&user_id, &password, &key).await?;
    println!("Account {user_id} initialised");
    Ok(())
}

#[cfg(unix)]
async fn run_command(config: &ServiceConfig, unlock: Vec<String>, tick_secs: u64) -> Result<()> {
    use vaultsync_core::ipc::IpcHub;

    let store = open_store(config).await?;
    let secret = paths::load_or_create_ipc_secret(&config.secret_path())?;
    let hub = Arc::new(IpcHub::new(BACKGROUND_CONTEXT, secret, config.socket_path()));
    let server_task = hub.spawn()?;

    let secrets = Arc::new(SecretStore::new());
    secrets.subscribe(Arc::new(|event: &SecretEvent| match event {
        SecretEvent::Available(user) => info!(user = %user, "user key available"),
        SecretEvent::Cleared(user) => info!(user = %user, "user key cleared"),
    }));
    let broker = SessionStateBroker::with_snapshot_timeout(hub.clone(), store.clone(), config.snapshot_timeout);
    let machine = Arc::new(
        LockStateMachine::new(broker, secrets).with_verifier(Arc::new(MasterPasswordVerifier::new(store))),
    );
    machine.resume().await?;

    for user in unlock {
        let user_id = UserId::new(user);
        let password = prompt_password_once(&format!("Master password for {user_id}: "))?;
        machine
            .authenticate(&user_id, &UnlockFactor::MasterPassword(password))
            .await?;
    }

    {
        let machine = machine.clone();
        hub.on(
            LOCK_COMMAND_TOPIC,
            Arc::new(move |payload| {
                let command: LockCommand = match serde_json::from_value(payload) {
                    Ok(command) => command,
                    Err(err) => {
                        warn!(error = %err, "malformed lock command");
                        return;
                    }
                };
                let machine = machine.clone();
                tokio::spawn(async move {
                    if let Err(err) = machine.lock(&command.user_id, LockReason::Manual).await {
                        warn!(user = %command.user_id, error = %err, "remote lock failed");
                    }
                });
            }),
        );
    }

    info!("service started");
    let mut ticker = tokio::time::interval(Duration::from_secs(tick_secs.max(1)));
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                if let Err(err) = machine.evaluate_timeouts(Utc::now(), TimeoutTrigger::Tick).await {
                    warn!(error = %err, "timeout evaluation failed");
                }
            }
            res = signal::ctrl_c() => {
                res?;
                break;
            }
        }
    }

    info!("service stopping");
    machine.evaluate_timeouts(Utc::now(), TimeoutTrigger::Restart).await?;
    machine.lock_all(LockReason::Manual).await?;
    server_task.abort();
    let _ = std::fs::remove_file(config.socket_path());
    Ok(())
}

#[cfg(not(unix))]
async fn run_command(_config: &ServiceConfig, _unlock: Vec<String>, _tick_secs: u64) -> Result<()> {
    Err(anyhow!("the background service requires a Unix socket transport"))
}

#[cfg(unix)]
async fn connect_to_background(config: &ServiceConfig, context_id: &str) -> Result<Arc<dyn CrossContextChannel>> {
    use vaultsync_core::ipc_client::IpcChannel;

    let secret = paths::load_or_create_ipc_secret(&config.secret_path())?;
    let channel =
        IpcChannel::connect_with_timeout(config.socket_path(), &secret, context_id, config.snapshot_timeout).await?;
    Ok(Arc::new(channel))
}

#[cfg(not(unix))]
async fn connect_to_background(_config: &ServiceConfig, _context_id: &str) -> Result<Arc<dyn CrossContextChannel>> {
    Err(anyhow!("socket transport unavailable on this platform"))
}

/// Mirror broker; without a reachable background it reads durable state only.
async fn mirror_broker(config: &ServiceConfig, context_id: &str) -> Result<SessionStateBroker> {
    let store = open_store(config).await?;
    let channel: Arc<dyn CrossContextChannel> = match connect_to_background(config, context_id).await {
        Ok(channel) => channel,
        Err(err) => {
            warn!(error = %err, "background unreachable; showing persisted state");
            let offline = LocalHub::new().connect(context_id);
            offline.disconnect();
            Arc::new(offline)
        }
    };
    Ok(SessionStateBroker::with_snapshot_timeout(channel, store, config.snapshot_timeout))
}

async fn status_command(config: &ServiceConfig, user_id: UserId) -> Result<()> {
    let broker = mirror_broker(config, "cli-status").await?;
    let scope = StateScope::User(user_id.clone());
    broker.define_mirror(LOCK_STATUS, scope.clone()).await?;
    let status = broker
        .current::<LockStatus>(LOCK_STATUS, &scope)
        .unwrap_or(LockStatus::LoggedOut);
    let revision = broker.revision(LOCK_STATUS, &scope).unwrap_or(0);
    println!("{user_id}: {status:?} (revision {revision})");
    Ok(())
}

async fn watch_command(config: &ServiceConfig, user_id: UserId) -> Result<()> {
    let broker = mirror_broker(config, "cli-watch").await?;
    let scope = StateScope::User(user_id.clone());
    broker.define_mirror(LOCK_STATUS, scope.clone()).await?;
    let mut last_seen = None;
    let mut poll = tokio::time::interval(Duration::from_millis(250));
    loop {
        tokio::select! {
            _ = poll.tick() => {
                let revision = broker.revision(LOCK_STATUS, &scope);
                if revision != last_seen {
                    last_seen = revision;
                    let status = broker.current::<LockStatus>(LOCK_STATUS, &scope);
                    println!("{user_id}: {status:?} (revision {})", revision.unwrap_or(0));
                }
            }
            res = signal::ctrl_c() => {
                res?;
                return Ok(());
            }
        }
    }
}

async fn lock_command(config: &ServiceConfig, user_id: UserId) -> Result<()> {
    let channel = connect_to_background(config, "cli-lock").await?;
    let broker = SessionStateBroker::with_snapshot_timeout(channel.clone(), open_store(config).await?, config.snapshot_timeout);
    let scope = StateScope::User(user_id.clone());
    broker.define_mirror(LOCK_STATUS, scope.clone()).await?;
    channel
        .broadcast(
            LOCK_COMMAND_TOPIC,
            serde_json::to_value(LockCommand {
                user_id: user_id.clone(),
            })?,
        )
        .await?;

    let deadline = tokio::time::Instant::now() + config.snapshot_timeout;
    while tokio::time::Instant::now() < deadline {
        match broker.current::<LockStatus>(LOCK_STATUS, &scope) {
            Some(LockStatus::Unlocked) => tokio::time::sleep(Duration::from_millis(50)).await,
            status => {
                println!("{user_id}: {:?}", status.unwrap_or(LockStatus::LoggedOut));
                return Ok(());
            }
        }
    }
    Err(anyhow!("background did not confirm the lock for {user_id}"))
}

async fn rotate_command(config: &ServiceConfig, user_id: UserId) -> Result<()> {
    if connect_to_background(config, "cli-rotate").await.is_ok() {
        return Err(anyhow!("background service is running; stop it before rotating keys"));
    }
    let store = open_store(config).await?;
    let rpc = Arc::new(HttpRpcClient::new(config)?);
    let password = prompt_password_once(&format!("Master password for {user_id}: "))?;

    let broker = SessionStateBroker::new(Arc::new(LocalHub::new().connect("rotate")), store.clone());
    let secrets = Arc::new(SecretStore::new());
    let machine = LockStateMachine::new(broker, secrets.clone())
        .with_verifier(Arc::new(MasterPasswordVerifier::new(store.clone())));
    machine.resume().await?;
    machine
        .authenticate(&user_id, &UnlockFactor::MasterPassword(password.clone()))
        .await?;

    let coordinator = KeyRotationCoordinator::new(secrets, store.clone(), rpc)
        .with_provider(Arc::new(LocalItemsProvider::new(store.clone())));
    let wrapper = RewrapKeyWrapper::new(store, password.as_str());
    let outcome = coordinator.rotate(&user_id, &wrapper).await;
    machine.lock(&user_id, LockReason::Manual).await?;
    let marker = match outcome {
        Ok(marker) => marker,
        Err(err) if err.rotation_committed() => {
            warn!(user = %user_id, error = %err, "rotation accepted by the server but not fully applied locally");
            return Err(anyhow!(err).context("the server already uses the new key; unlock will need it"));
        }
        Err(err) => return Err(err.into()),
    };
    println!(
        "Rotated user key for {user_id} at {} ({})",
        marker.rotated_at,
        marker.providers.join(", ")
    );
    Ok(())
}
