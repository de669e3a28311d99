//! `netstate`: watches host connectivity and logs every transition.
//!
//! Usage: `netstate [CONFIG]`. Without an argument the config is read from
//! `$NETSTATE_CONFIG`, falling back to `./netstate.json`.

mod config;
mod link;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use netstate_http_probe::HttpProbe;
use chrono::{DateTime, Local};
use netstate_monitor::{ManualLink, MonitorSnapshot, NetworkEvent, NetworkMonitor};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

const INTERFACE_POLL: Duration = Duration::from_secs(2);

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new("info,netstate_monitor=debug,netstate_http_probe=debug")
        }))
        .init();

    let path = std::env::args_os()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(config::default_path);
    let config = config::AppConfig::load(&path)?;
    info!(
        version = env!("CARGO_PKG_VERSION"),
        config = %path.display(),
        url = %config.url,
        "starting netstate"
    );

    let transport = Arc::new(HttpProbe::new(&config.url)?);
    let link = Arc::new(ManualLink::new(link::link_is_up()));

    let cancel = CancellationToken::new();
    tokio::spawn(link::watch_link(
        link.clone(),
        INTERFACE_POLL,
        cancel.clone(),
        link::link_is_up,
    ));

    let mut builder = NetworkMonitor::builder(config.reconnect);
    let mut events = builder.subscribe();
    let monitor = builder.start(link, transport)?;

    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("interrupted");
                break;
            }
            event = events.recv() => match event {
                Some(event) => report(&monitor, event),
                None => break,
            },
        }
    }

    cancel.cancel();
    monitor.shutdown();
    Ok(())
}

/// Logs an event together with the monitor's current retry outlook.
fn report(monitor: &NetworkMonitor, event: NetworkEvent) {
    match event {
        NetworkEvent::Changed(state) => {
            let snapshot = monitor.snapshot();
            match next_retry_at(&snapshot, Local::now()) {
                Some(next) => {
                    info!(
                        %state,
                        attempt = snapshot.attempts,
                        next_retry = %next.format("%H:%M:%S"),
                        "connectivity"
                    );
                }
                None if state.is_limited() => {
                    warn!(%state, attempts = snapshot.attempts, "no retry scheduled");
                }
                None => info!(%state, "connectivity"),
            }
            match serde_json::to_string(&snapshot) {
                Ok(line) => println!("{line}"),
                Err(e) => warn!(error = %e, "failed to encode snapshot"),
            }
        }
        NetworkEvent::ConnectionChanged(info) => {
            info!(
                effective_type = ?info.effective_type,
                downlink_mbps = ?info.downlink_mbps,
                rtt_ms = ?info.rtt_ms,
                save_data = info.save_data,
                "link characteristics changed"
            );
        }
    }
}

/// Wall-clock time of the pending retry described by `snapshot`.
fn next_retry_at(snapshot: &MonitorSnapshot, now: DateTime<Local>) -> Option<DateTime<Local>> {
    let remaining = chrono::Duration::from_std(Duration::from_millis(snapshot.remaining_ms?)).ok()?;
    now.checked_add_signed(remaining)
}
