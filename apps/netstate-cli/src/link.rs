//! Host link detection from local network interfaces.

use std::net::IpAddr;
use std::sync::Arc;
use std::time::Duration;

use netstate_monitor::ManualLink;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Whether any interface carries a routable address.
pub fn link_is_up() -> bool {
    let Ok(interfaces) = if_addrs::get_if_addrs() else {
        return false;
    };
    interfaces
        .iter()
        .any(|iface| !iface.is_loopback() && is_routable(iface.ip()))
}

fn is_routable(ip: IpAddr) -> bool {
    match ip {
        IpAddr::V4(v4) => !v4.is_loopback() && !v4.is_link_local() && !v4.is_unspecified(),
        // fe80::/10
        IpAddr::V6(v6) => {
            !v6.is_loopback() && !v6.is_unspecified() && (v6.segments()[0] & 0xffc0) != 0xfe80
        }
    }
}

/// Polls `is_up` every `period` and mirrors it onto `link`.
pub async fn watch_link(
    link: Arc<ManualLink>,
    period: Duration,
    cancel: CancellationToken,
    is_up: impl Fn() -> bool,
) {
    let mut interval = tokio::time::interval(period);
    interval.tick().await; // Skip immediate first tick.

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = interval.tick() => {
                let up = is_up();
                debug!(up, "interface poll");
                link.set_link_up(up);
            }
        }
    }
}
