//! LAN discovery: a host multicasts [`Announce`] beacons while listening;
//! a scan joins the multicast group for a bounded window and publishes every
//! matching host it hears.

use std::net::{Ipv4Addr, SocketAddr};
use std::sync::Arc;
use std::time::Duration;

use bluwave_core::Announce;
use tokio::net::UdpSocket;
use tokio::time::{timeout, Instant};

use crate::engine::Inner;

const MULTICAST_GROUP: Ipv4Addr = Ipv4Addr::new(239, 255, 77, 77);
const ANNOUNCE_INTERVAL: Duration = Duration::from_secs(2);

/// Beacon loop run while hosting. Send failures are ignored; discovery is
/// best-effort and the chat transport does not depend on it.
pub(crate) async fn announce_loop(inner: Arc<Inner>, transport_port: u16) {
    let announce = Announce {
        protocol_version: bluwave_core::PROTOCOL_VERSION,
        service_uuid: bluwave_core::SERVICE_UUID,
        service_name: bluwave_core::SERVICE_NAME.to_string(),
        device_id: inner.device_id,
        name: inner.config.display_name.clone(),
        transport_port,
    };
    let frame = match announce.to_bytes() {
        Ok(f) => f,
        Err(err) => {
            tracing::warn!(error = %err, "announce encode failed; discovery off");
            return;
        }
    };
    let socket = match UdpSocket::bind((Ipv4Addr::UNSPECIFIED, 0)).await {
        Ok(s) => s,
        Err(err) => {
            tracing::warn!(error = %err, "announce socket bind failed; discovery off");
            return;
        }
    };
    let dest = SocketAddr::from((MULTICAST_GROUP, inner.config.discovery_port));
    loop {
        let _ = socket.send_to(&frame, dest).await;
        tokio::time::sleep(ANNOUNCE_INTERVAL).await;
    }
}

/// Listen for host announces for `window`, publishing matching hosts to the
/// discovered-devices observable and remembering their transport addresses.
pub(crate) async fn scan(inner: Arc<Inner>, window: Duration) -> std::io::Result<()> {
    let socket = bind_multicast(inner.config.discovery_port)?;
    let deadline = Instant::now() + window;
    let mut buf = vec![0u8; 2048];
    let mut found = Vec::new();

    loop {
        let remaining = deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            break;
        }
        let (n, from) = match timeout(remaining, socket.recv_from(&mut buf)).await {
            Ok(Ok(r)) => r,
            Ok(Err(err)) => return Err(err),
            Err(_) => break, // window elapsed
        };
        let Ok(announce) = Announce::from_bytes(&buf[..n]) else {
            continue;
        };
        if !announce.matches_service() || announce.device_id == inner.device_id {
            continue;
        }
        let addr = SocketAddr::new(from.ip(), announce.transport_port);
        tracing::debug!(host = %announce.device_id, %addr, "host discovered");

        let mut state = inner.state.lock().await;
        state.registry.observe(announce.device_id, &announce.name, true);
        state.host_addrs.insert(announce.device_id, addr);
        if !found.contains(&announce.device_id) {
            found.push(announce.device_id);
        }
        let devices = found
            .iter()
            .filter_map(|id| state.registry.device(*id).cloned())
            .collect();
        inner.watches.discovered_tx.send_replace(devices);
    }
    Ok(())
}

fn bind_multicast(discovery_port: u16) -> std::io::Result<UdpSocket> {
    let std_sock = std::net::UdpSocket::bind((Ipv4Addr::UNSPECIFIED, discovery_port))?;
    std_sock.join_multicast_v4(&MULTICAST_GROUP, &Ipv4Addr::UNSPECIFIED)?;
    std_sock.set_multicast_ttl_v4(1)?;
    std_sock.set_nonblocking(true)?;
    UdpSocket::from_std(std_sock)
}
