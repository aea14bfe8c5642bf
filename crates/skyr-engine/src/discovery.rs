//! ---
//! skyr_section: "03-device-pool-engine"
//! skyr_subsection: "module"
//! skyr_type: "source"
//! skyr_scope: "code"
//! skyr_description: "UDP discovery client locating Alpaca servers and their devices."
//! skyr_version: "v0.0.0-prealpha"
//! skyr_owner: "tbd"
//! ---
use std::net::{Ipv4Addr, SocketAddr};
use std::time::Duration;

use skyr_net::{DiscoveryResponse, DISCOVERY_TOKEN};
use tokio::net::UdpSocket;
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

use crate::client::AlpacaClient;
use crate::error::ClientError;
use crate::model::AlpacaDevice;

const RECEIVE_BUFFER: usize = 1024;

/// Broadcast address for a discovery port.
pub fn broadcast_target(port: u16) -> SocketAddr {
    SocketAddr::from((Ipv4Addr::BROADCAST, port))
}

/// Send one discovery probe to `target` and collect server URLs until `wait` elapses.
///
/// Malformed replies are ignored. URLs are returned in arrival order without duplicates.
pub async fn discover_servers(target: SocketAddr, wait: Duration) -> Result<Vec<String>, ClientError> {
    let socket = UdpSocket::bind(SocketAddr::from((Ipv4Addr::UNSPECIFIED, 0))).await?;
    socket.set_broadcast(true)?;
    socket.send_to(DISCOVERY_TOKEN, target).await?;
    debug!(%target, "discovery probe sent");

    let deadline = Instant::now() + wait;
    let mut buffer = [0u8; RECEIVE_BUFFER];
    let mut servers: Vec<String> = Vec::new();
    loop {
        let (len, peer) = match timeout_at(deadline, socket.recv_from(&mut buffer)).await {
            Err(_) => break,
            Ok(Err(err)) => {
                warn!(error = %err, "discovery receive failed");
                continue;
            }
            Ok(Ok(received)) => received,
        };
        let reply: DiscoveryResponse = match serde_json::from_slice(&buffer[..len]) {
            Ok(reply) => reply,
            Err(err) => {
                debug!(%peer, error = %err, "ignoring malformed discovery reply");
                continue;
            }
        };
        let url = format!("http://{}", SocketAddr::new(peer.ip(), reply.alpaca_port));
        if !servers.contains(&url) {
            debug!(server_url = %url, "alpaca server answered");
            servers.push(url);
        }
    }
    Ok(servers)
}

/// Discover servers reachable at `target` and list every device they host.
///
/// A server whose device list cannot be fetched is skipped.
pub async fn discover_at(
    client: &AlpacaClient,
    target: SocketAddr,
    wait: Duration,
) -> Result<Vec<AlpacaDevice>, ClientError> {
    let servers = discover_servers(target, wait).await?;
    let mut devices = Vec::new();
    for server_url in &servers {
        match client.configured_devices(server_url).await {
            Ok(found) => devices.extend(found),
            Err(err) => warn!(server_url = %server_url, error = %err, "skipping server without device list"),
        }
    }
    info!(servers = servers.len(), devices = devices.len(), "discovery finished");
    Ok(devices)
}

/// Broadcast discovery on the local network.
pub async fn discover(client: &AlpacaClient, port: u16, wait: Duration) -> Result<Vec<AlpacaDevice>, ClientError> {
    discover_at(client, broadcast_target(port), wait).await
}
