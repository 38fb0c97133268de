//! One network path: a UDP socket pinned to a local interface
//!
//! The peer's address is not configured; it is learnt from the first
//! datagram that arrives on the path and may only move to a new address
//! once a datagram from there has decrypted successfully. Sending is
//! best-effort: a path without a discovered peer is skipped silently.

use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4, UdpSocket};
use std::sync::RwLock;
use std::time::Duration;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::debug;

use crate::config::EndpointConfig;
use crate::constants::UDP_IP_OVERHEAD;
use crate::error::{NetworkError, Result};
use crate::stats;

/// How long a receive blocks before re-checking the shutdown flag
const RECV_TIMEOUT: Duration = Duration::from_millis(500);

/// Relationship of a datagram's source to the discovered peer
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerStatus {
    /// First traffic on this path; the source is now the peer
    Discovered,
    /// Matches the discovered peer
    Known,
    /// Differs from the discovered peer; promote only after the
    /// datagram authenticates
    Foreign,
}

pub struct Endpoint {
    index: usize,
    interface: String,
    socket: UdpSocket,
    peer: RwLock<Option<SocketAddr>>,
}

impl Endpoint {
    /// Bind a socket on `config.port`, pinned to the named interface.
    pub fn bind(index: usize, config: &EndpointConfig) -> Result<Self> {
        let socket = Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP))
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;
        socket
            .set_reuse_address(true)
            .map_err(|e| NetworkError::BindFailed(e.to_string()))?;

        #[cfg(target_os = "linux")]
        if !config.interface.is_empty() {
            socket
                .bind_device(Some(config.interface.as_bytes()))
                .map_err(|e| {
                    NetworkError::BindFailed(format!(
                        "cannot bind to interface {}: {e}",
                        config.interface
                    ))
                })?;
        }
        #[cfg(not(target_os = "linux"))]
        if !config.interface.is_empty() {
            tracing::warn!(
                interface = %config.interface,
                "interface binding is only supported on Linux; using the default route"
            );
        }

        let addr = SocketAddrV4::new(Ipv4Addr::UNSPECIFIED, config.port);
        socket
            .bind(&addr.into())
            .map_err(|e| NetworkError::BindFailed(format!("port {}: {e}", config.port)))?;

        let socket: UdpSocket = socket.into();
        socket.set_read_timeout(Some(RECV_TIMEOUT))?;

        stats::registry().endpoints[index]
            .open
            .store(1, std::sync::atomic::Ordering::Relaxed);

        Ok(Self {
            index,
            interface: config.interface.clone(),
            socket,
            peer: RwLock::new(None),
        })
    }

    pub fn index(&self) -> usize {
        self.index
    }

    pub fn interface(&self) -> &str {
        &self.interface
    }

    /// Blocking receive with the shutdown-poll timeout
    pub fn recv_from(&self, buf: &mut [u8]) -> std::io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf)
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.socket.local_addr()
    }

    pub fn peer(&self) -> Option<SocketAddr> {
        *self.peer.read().unwrap_or_else(|e| e.into_inner())
    }

    /// Classify a datagram source, recording it if this path had no peer.
    pub fn observe(&self, src: SocketAddr) -> PeerStatus {
        if let Some(peer) = self.peer() {
            if peer == src {
                return PeerStatus::Known;
            }
            return PeerStatus::Foreign;
        }
        let mut peer = self.peer.write().unwrap_or_else(|e| e.into_inner());
        match *peer {
            Some(existing) if existing == src => PeerStatus::Known,
            Some(_) => PeerStatus::Foreign,
            None => {
                *peer = Some(src);
                PeerStatus::Discovered
            }
        }
    }

    /// Move the peer to an address that has authenticated.
    pub fn promote(&self, src: SocketAddr) {
        let mut peer = self.peer.write().unwrap_or_else(|e| e.into_inner());
        if *peer != Some(src) {
            debug!(endpoint = self.index, peer = %src, "peer address moved");
            *peer = Some(src);
        }
    }

    /// Send one datagram to the discovered peer. Paths without a peer or
    /// with a transient send failure are skipped without error.
    pub fn send_to_peer(&self, buf: &[u8]) {
        let Some(peer) = self.peer() else {
            return;
        };
        match self.socket.send_to(buf, peer) {
            Ok(sent) => {
                stats::add_u64(
                    &stats::registry().endpoints[self.index].bytes_out,
                    sent as u64 + UDP_IP_OVERHEAD,
                );
            }
            Err(e) => debug!(endpoint = self.index, error = %e, "send skipped"),
        }
    }

    /// Account one received datagram
    pub fn note_received(&self, len: usize) {
        stats::add_u64(
            &stats::registry().endpoints[self.index].bytes_in,
            len as u64 + UDP_IP_OVERHEAD,
        );
    }
}
