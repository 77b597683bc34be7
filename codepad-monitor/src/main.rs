//! CodePad collaboration monitor.
//!
//! Joins the collaboration channel of one document and logs what the other
//! editors do: caret moves, selections, edits and connection changes. Useful
//! for checking a collaboration server without opening the editor.

use std::path::PathBuf;
use std::time::Duration;

use clap::Parser;
use codepad_collab::{
    CollabConfig, CollabService, CollabStatus, PresenceBroadcaster, PresenceConfig,
    ReconnectPolicy, TextChange,
};
use log::info;

/// How long to wait for the channel to report it has closed.
const LEAVE_TIMEOUT: Duration = Duration::from_secs(1);
/// Time left for the socket writer to flush its close frame.
const CLOSE_GRACE: Duration = Duration::from_millis(100);

/// Monitor command line arguments.
#[derive(Parser, Debug)]
#[command(name = "codepad-monitor")]
#[command(about = "Watch a CodePad document's collaboration channel")]
struct Args {
    /// Collaboration server base URL [default: ws://localhost:3001]
    #[arg(short, long, value_name = "URL")]
    server: Option<String>,

    /// Document to join
    #[arg(short, long, value_name = "ID")]
    file_id: String,

    /// JSON config file; command line flags override it
    #[arg(short, long, value_name = "PATH")]
    config: Option<PathBuf>,

    /// Retry at a fixed delay instead of exponential backoff
    #[arg(long, value_name = "MS")]
    fixed_delay_ms: Option<u64>,

    /// Identity to announce (generated when omitted)
    #[arg(short, long, value_name = "ID")]
    user_id: Option<String>,
}

impl Args {
    fn into_config(self) -> Result<(CollabConfig, String), codepad_collab::ConfigError> {
        let mut config = match &self.config {
            Some(path) => CollabConfig::from_json_file(path)?,
            None => CollabConfig::default(),
        };
        if let Some(server) = self.server {
            config.server_url = server;
        }
        if let Some(ms) = self.fixed_delay_ms {
            config.reconnect = ReconnectPolicy::fixed(Duration::from_millis(ms));
        }
        if let Some(user_id) = self.user_id {
            config.local_user_id = Some(user_id);
        }
        config.validate()?;
        Ok((config, self.file_id))
    }
}

fn describe_status(status: &CollabStatus) -> String {
    match status {
        CollabStatus::Idle => "idle".to_string(),
        CollabStatus::Connecting { attempt: 0 } => "connecting".to_string(),
        CollabStatus::Connecting { attempt } => format!("connecting (retry {attempt})"),
        CollabStatus::Open => "connected".to_string(),
        CollabStatus::Reconnecting { attempt, retry_in } => {
            format!("reconnecting in {retry_in:?} (retry {attempt})")
        }
        CollabStatus::Offline { attempts } => format!("offline after {attempts} retries"),
    }
}

fn log_edit(sender: &str, changes: &[TextChange]) {
    for change in changes {
        let range = change.range;
        info!(
            "{sender} edited {}:{}-{}:{} ({} chars)",
            range.start_line_number,
            range.start_column,
            range.end_line_number,
            range.end_column,
            change.text.chars().count()
        );
    }
}

/// Disconnect and wait until the service reports it is idle.
async fn leave(service: &CollabService) {
    service.disconnect();
    let mut status = service.watch_status();
    let idle = status.wait_for(|s| *s == CollabStatus::Idle);
    if tokio::time::timeout(LEAVE_TIMEOUT, idle).await.is_err() {
        log::warn!("Channel did not close within {LEAVE_TIMEOUT:?}");
    }
    tokio::time::sleep(CLOSE_GRACE).await;
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();

    let (config, file_id) = Args::parse().into_config()?;
    info!("Starting CodePad monitor for {file_id} on {}", config.server_url);

    let service = CollabService::new(config);
    info!("Local user id: {}", service.local_user_id());

    let mut presence =
        PresenceBroadcaster::attach(service.clone(), PresenceConfig::default()).await?;
    presence.on_remote_edit(log_edit).await?;

    let mut status = service.watch_status();
    service.connect(file_id.as_str());

    let mut report = tokio::time::interval(Duration::from_secs(5));
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, leaving {file_id}");
                break;
            }
            changed = status.changed() => {
                if changed.is_err() {
                    break;
                }
                let current = status.borrow_and_update().clone();
                match current {
                    CollabStatus::Offline { .. } => {
                        log::error!("Channel {}", describe_status(&current))
                    }
                    _ => info!("Channel {}", describe_status(&current)),
                }
            }
            _ = report.tick() => {
                for id in presence.prune_idle() {
                    info!("{id} left (idle)");
                }
                for peer in presence.remote_collaborators() {
                    let cursor = peer
                        .cursor
                        .map(|p| format!("{}:{}", p.line_number, p.column))
                        .unwrap_or_else(|| "-".to_string());
                    info!("{} {} at {cursor}", peer.color.to_hex(), peer.user_id);
                }
            }
        }
    }

    presence.detach();
    leave(&service).await;

    let stats = service.stats();
    info!(
        "Frames: {} received, {} sent, {} dropped; {} connect attempts",
        stats.frames_received, stats.frames_sent, stats.frames_dropped, stats.connect_attempts
    );
    Ok(())
}
