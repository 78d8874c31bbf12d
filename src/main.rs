//! Courier CLI
//!
//! ## Usage
//!
//! ```bash
//! # Pair a session (prints pairing codes until the phone approves one)
//! courier authenticate
//!
//! # Is the stored session usable?
//! courier check-auth
//!
//! # Send outbox.txt to a group
//! GROUP_ID=120363000000000000@g.us courier send
//!
//! # Send another file, with a config file and a remote bridge
//! courier --config courier.toml --bridge-url ws://bridge:8787 send --payload-file note.txt
//!
//! # Refresh the session without sending anything
//! courier keep-alive
//! ```
//!
//! Exit code 0 means success; 1 means a terminal failure. `send` always leaves
//! `send_status.json` describing the outcome.

use anyhow::Context;
use clap::{Parser, Subcommand};
use courier::config::StatusConfig;
use courier::dispatch::load_payload;
use courier::transport::Transport;
use courier::{
    BridgeTransport, Config, DispatchController, DispatchError, KeepAlive,
    KeepAliveSettings, PairingFlow, PairingSettings, SessionStore, StatusReporter, StdoutDisplay,
};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "courier")]
#[command(about = "One-shot message dispatch over a persistent messaging session")]
struct Args {
    /// Path to config file
    #[arg(short, long, env = "COURIER_CONFIG")]
    config: Option<PathBuf>,

    /// Directory holding the session credentials
    #[arg(long, env = "COURIER_AUTH_DIR")]
    auth_dir: Option<PathBuf>,

    /// Where the delivery status record is written
    #[arg(long, env = "COURIER_STATUS_FILE")]
    status_file: Option<PathBuf>,

    /// WebSocket URL of the messaging bridge
    #[arg(long, env = "COURIER_BRIDGE_URL")]
    bridge_url: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Deliver one message and record the outcome
    Send {
        /// Destination (group id)
        #[arg(long, env = "GROUP_ID")]
        target: Option<String>,

        /// File containing the message body
        #[arg(long, env = "OUTBOX_FILE", default_value = "outbox.txt")]
        payload_file: PathBuf,
    },
    /// Pair a new session
    Authenticate,
    /// Check whether the stored session is usable
    CheckAuth,
    /// Open the stored session briefly so rotated credentials get saved
    KeepAlive,
}

#[tokio::main]
async fn main() -> anyhow::Result<ExitCode> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive("courier=info".parse()?))
        .init();

    let args = Args::parse();

    // Load config
    let mut config = match &args.config {
        Some(path) => match Config::load(path) {
            Ok(config) => config,
            Err(e) if matches!(args.command, Command::Send { .. }) => {
                error!(path = %path.display(), error = %e, "Cannot load config");
                let status_file = args
                    .status_file
                    .clone()
                    .unwrap_or_else(|| StatusConfig::default().file);
                StatusReporter::new(status_file).record_failure(&e).await;
                return Ok(ExitCode::from(1));
            }
            Err(e) => {
                return Err(e).with_context(|| format!("failed to load {}", path.display()))
            }
        },
        None => Config::default(),
    };

    // Apply CLI overrides
    if let Some(dir) = args.auth_dir {
        config.session.auth_dir = dir;
    }
    if let Some(file) = args.status_file {
        config.status.file = file;
    }
    if let Some(url) = args.bridge_url {
        config.bridge.url = url;
    }

    let store = Arc::new(
        SessionStore::new(config.creds_path())
            .with_poll_interval(Duration::from_millis(config.session.ready_poll_ms)),
    );
    let transport: Arc<dyn Transport> = Arc::new(BridgeTransport::new(
        config.bridge.url.clone(),
        Duration::from_secs(config.dispatch.query_timeout_secs),
    ));

    let code = match args.command {
        Command::Send {
            target,
            payload_file,
        } => send(&config, transport, store, target.unwrap_or_default(), payload_file).await,
        Command::Authenticate => authenticate(&config, transport, store).await,
        Command::CheckAuth => check_auth(&store).await,
        Command::KeepAlive => keep_alive(&config, transport, store).await,
    };

    Ok(ExitCode::from(code))
}

async fn send(
    config: &Config,
    transport: Arc<dyn Transport>,
    store: Arc<SessionStore>,
    target: String,
    payload_file: PathBuf,
) -> u8 {
    let reporter = Arc::new(StatusReporter::new(&config.status.file));

    info!(
        target = %target,
        payload_file = %payload_file.display(),
        status_file = %config.status.file.display(),
        "Starting courier send"
    );

    let payload = match load_payload(&payload_file).await {
        Ok(payload) => payload,
        Err(e) => {
            error!(error = %e, "Cannot read payload");
            reporter.record_failure(&e).await;
            return 1;
        }
    };

    let controller = DispatchController::new(transport, store, Arc::clone(&reporter));
    let budget = config.budget();

    tokio::select! {
        outcome = controller.dispatch(&target, &payload, &budget) => outcome.exit_code(),
        _ = tokio::signal::ctrl_c() => {
            warn!("Interrupted, tearing down the connection");
            let err = DispatchError::Interrupted("received Ctrl-C".to_string());
            reporter.record_failure(&err).await;
            if reporter.has_success().await { 0 } else { 1 }
        }
    }
}

async fn authenticate(config: &Config, transport: Arc<dyn Transport>, store: Arc<SessionStore>) -> u8 {
    let flow = PairingFlow::new(transport, Arc::clone(&store), PairingSettings::from_config(config));

    match flow.run(&StdoutDisplay).await {
        Ok(()) => {
            println!("Session ready ({})", store.describe().await);
            0
        }
        Err(e) => {
            error!(kind = e.kind(), error = %e, "Pairing failed");
            1
        }
    }
}

async fn check_auth(store: &SessionStore) -> u8 {
    store.load().await;
    let ready = store.is_ready().await;
    let detail = store.describe().await;

    if ready {
        println!("Session ready: {}", detail);
        0
    } else {
        println!("Session not ready: {}", detail);
        println!("Run `courier authenticate` to pair a device.");
        1
    }
}

async fn keep_alive(config: &Config, transport: Arc<dyn Transport>, store: Arc<SessionStore>) -> u8 {
    let keepalive = KeepAlive::new(transport, store, KeepAliveSettings::from_config(config));

    match keepalive.run().await {
        Ok(reconnects) => {
            info!(reconnects = reconnects, "Keep-alive complete");
            0
        }
        Err(e) => {
            error!(kind = e.kind(), error = %e, "Keep-alive failed");
            1
        }
    }
}
