//! ---
//! skyr_section: "05-networking-external-interfaces"
//! skyr_subsection: "module"
//! skyr_type: "source"
//! skyr_scope: "code"
//! skyr_description: "Alpaca UDP discovery responder."
//! skyr_version: "v0.0.0-prealpha"
//! skyr_owner: "tbd"
//! ---
use std::net::SocketAddr;
use std::time::Duration;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tokio::net::UdpSocket;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Exact datagram an Alpaca client broadcasts.
pub const DISCOVERY_TOKEN: &[u8] = b"alpacadiscovery1";

const RECEIVE_BUFFER: usize = 1024;
const READ_DEADLINE: Duration = Duration::from_secs(1);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiscoveryResponse {
    #[serde(rename = "AlpacaPort")]
    pub alpaca_port: u16,
}

/// Answers discovery datagrams with the REST API port.
pub struct DiscoveryResponder {
    bind: SocketAddr,
    api_port: u16,
}

impl DiscoveryResponder {
    pub fn new(bind: SocketAddr, api_port: u16) -> Self {
        Self { bind, api_port }
    }

    pub async fn spawn(self) -> Result<DiscoveryHandle> {
        let socket = UdpSocket::bind(self.bind)
            .await
            .with_context(|| format!("failed to bind discovery socket on {}", self.bind))?;
        let address = socket.local_addr()?;
        let reply = serde_json::to_vec(&DiscoveryResponse {
            alpaca_port: self.api_port,
        })?;
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        info!(%address, api_port = self.api_port, "discovery responder listening");
        let task = tokio::spawn(answer_discovery(socket, reply, shutdown_rx));
        Ok(DiscoveryHandle {
            address,
            task,
            shutdown: shutdown_tx,
        })
    }
}

async fn answer_discovery(socket: UdpSocket, reply: Vec<u8>, mut shutdown: watch::Receiver<bool>) {
    let mut buffer = [0u8; RECEIVE_BUFFER];
    loop {
        if *shutdown.borrow() {
            break;
        }
        tokio::select! {
            changed = shutdown.changed() => {
                if changed.is_err() || *shutdown.borrow() {
                    break;
                }
            }
            received = tokio::time::timeout(READ_DEADLINE, socket.recv_from(&mut buffer)) => {
                match received {
                    // deadline elapsed; re-check shutdown
                    Err(_) => continue,
                    Ok(Err(err)) => warn!(error = %err, "discovery receive failed"),
                    Ok(Ok((len, peer))) if &buffer[..len] == DISCOVERY_TOKEN => {
                        match socket.send_to(&reply, peer).await {
                            Ok(_) => debug!(%peer, "answered discovery request"),
                            Err(err) => warn!(%peer, error = %err, "discovery reply failed"),
                        }
                    }
                    Ok(Ok((len, peer))) => debug!(%peer, len, "ignoring unexpected datagram"),
                }
            }
        }
    }
    debug!("discovery responder stopped");
}

pub struct DiscoveryHandle {
    address: SocketAddr,
    task: JoinHandle<()>,
    shutdown: watch::Sender<bool>,
}

impl DiscoveryHandle {
    pub fn local_addr(&self) -> SocketAddr {
        self.address
    }

    pub async fn shutdown(self) -> Result<()> {
        let _ = self.shutdown.send(true);
        self.task.await.context("discovery task failed")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn responder(api_port: u16) -> DiscoveryHandle {
        DiscoveryResponder::new("127.0.0.1:0".parse().unwrap(), api_port)
            .spawn()
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn answers_the_discovery_token_with_the_api_port() {
        let handle = responder(11111).await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        client
            .send_to(DISCOVERY_TOKEN, handle.local_addr())
            .await
            .unwrap();

        let mut buffer = [0u8; 128];
        let (len, _) = tokio::time::timeout(Duration::from_secs(2), client.recv_from(&mut buffer))
            .await
            .unwrap()
            .unwrap();
        let reply: DiscoveryResponse = serde_json::from_slice(&buffer[..len]).unwrap();
        assert_eq!(reply, DiscoveryResponse { alpaca_port: 11111 });
        assert_eq!(&buffer[..len], br#"{"AlpacaPort":11111}"#);
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn ignores_other_datagrams() {
        let handle = responder(4567).await;
        let client = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        for junk in [&b"alpacadiscovery1 "[..], b"ALPACADISCOVERY1", b"alpacadiscovery"] {
            client.send_to(junk, handle.local_addr()).await.unwrap();
        }
        let mut buffer = [0u8; 128];
        let outcome =
            tokio::time::timeout(Duration::from_millis(300), client.recv_from(&mut buffer)).await;
        assert!(outcome.is_err(), "no reply expected");
        handle.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn shutdown_completes_within_the_read_deadline() {
        let handle = responder(1).await;
        tokio::time::timeout(READ_DEADLINE * 3, handle.shutdown())
            .await
            .unwrap()
            .unwrap();
    }
}
