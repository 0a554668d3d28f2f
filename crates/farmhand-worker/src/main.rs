//! Farmhand Worker Daemon

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::info;
use tracing_subscriber::EnvFilter;

use farmhand_worker::shutdown::install_shutdown_handler;
use farmhand_worker::{Config, HttpManagerApi, Worker, WorkerIdentity};

/// Render-farm worker: runs tasks handed out by a manager.
#[derive(Parser, Debug)]
#[command(name = "farmhand-worker", version, about)]
struct Args {
    /// Manager base URL
    #[arg(long, env = "FARMHAND_MANAGER_URL")]
    manager_url: String,

    /// Directory for credentials and the task marker
    #[arg(long, env = "FARMHAND_STATE_DIR", default_value = "./farmhand-state")]
    state_dir: PathBuf,

    /// Name shown by the manager (defaults to $HOSTNAME)
    #[arg(long, env = "FARMHAND_NICKNAME")]
    nickname: Option<String>,

    /// Task types this worker accepts
    #[arg(
        long,
        env = "FARMHAND_TASK_TYPES",
        value_delimiter = ',',
        default_value = "sleep,echo,exec"
    )]
    task_types: Vec<String>,

    #[arg(long, env = "FARMHAND_POLL_INTERVAL_SECS", default_value = "5")]
    poll_interval_secs: u64,

    #[arg(long, env = "FARMHAND_HEARTBEAT_INTERVAL_SECS", default_value = "15")]
    heartbeat_interval_secs: u64,

    /// First retry delay after a failed manager call
    #[arg(long, env = "FARMHAND_BACKOFF_INITIAL_MS", default_value = "500")]
    backoff_initial_ms: u64,

    /// Longest single retry delay
    #[arg(long, env = "FARMHAND_BACKOFF_CEILING_SECS", default_value = "30")]
    backoff_ceiling_secs: u64,

    #[arg(long, env = "FARMHAND_MAX_ATTEMPTS", default_value = "8")]
    max_attempts: u32,

    #[arg(long, env = "FARMHAND_REQUEST_TIMEOUT_SECS", default_value = "30")]
    request_timeout_secs: u64,

    /// How often buffered output is sent to the manager
    #[arg(long, env = "FARMHAND_PUSH_INTERVAL_MS", default_value = "1000")]
    push_interval_ms: u64,

    /// How often to ask the manager whether the running task may continue
    #[arg(long, env = "FARMHAND_CANCEL_CHECK_INTERVAL_SECS", default_value = "10")]
    cancel_check_interval_secs: u64,

    /// Default timeout for exec commands
    #[arg(long, env = "FARMHAND_COMMAND_TIMEOUT_SECS")]
    command_timeout_secs: Option<u64>,

    /// Output kept per command before truncating
    #[arg(long, env = "FARMHAND_MAX_OUTPUT_BYTES", default_value_t = 16 * 1024 * 1024)]
    max_output_bytes: u64,

    /// Time allowed for the final report on shutdown
    #[arg(long, env = "FARMHAND_SHUTDOWN_GRACE_SECS", default_value = "10")]
    shutdown_grace_secs: u64,
}

impl Args {
    fn into_config(self) -> Config {
        let defaults = Config::default();
        Config {
            manager_url: self.manager_url,
            state_dir: self.state_dir,
            nickname: self
                .nickname
                .or_else(|| std::env::var("HOSTNAME").ok())
                .unwrap_or(defaults.nickname),
            task_types: self.task_types,
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            heartbeat_interval: Duration::from_secs(self.heartbeat_interval_secs),
            backoff_initial: Duration::from_millis(self.backoff_initial_ms),
            backoff_ceiling: Duration::from_secs(self.backoff_ceiling_secs),
            max_attempts: self.max_attempts,
            request_timeout: Duration::from_secs(self.request_timeout_secs),
            push_interval: Duration::from_millis(self.push_interval_ms),
            cancel_check_interval: Duration::from_secs(self.cancel_check_interval_secs),
            command_timeout: self.command_timeout_secs.map(Duration::from_secs),
            max_output_bytes: self.max_output_bytes,
            shutdown_grace: Duration::from_secs(self.shutdown_grace_secs),
            ..defaults
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let args = Args::parse();

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("farmhand=info".parse()?))
        .with_target(true)
        .init();

    let config = args.into_config();
    config.validate()?;

    let identity = WorkerIdentity::load_or_create(
        &config.state_dir.join("credentials.json"),
        config.nickname.clone(),
        config.task_types.clone(),
    )
    .await?;

    info!(
        worker_id = %identity.worker_id,
        nickname = %identity.nickname,
        manager = %config.manager_url,
        state_dir = %config.state_dir.display(),
        "Starting farmhand worker"
    );

    let api = HttpManagerApi::new(&config.manager_url, config.request_timeout)?;
    let shutdown = install_shutdown_handler();
    let worker = Worker::new(config, Arc::new(api), identity, shutdown);
    worker.run().await?;

    info!("Farmhand worker stopped");
    Ok(())
}
