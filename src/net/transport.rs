//! Multi-endpoint secure transport
//!
//! Owns the tunnel, the endpoints and their threads:
//!
//! - one receive thread per endpoint, running the entire
//!   decrypt → demux → decode → resample pipeline synchronously,
//! - one tick thread driving the tunnel timers, elevated to realtime
//!   priority so receive contention on the tunnel lock cannot starve the
//!   handshake schedule,
//! - one short-lived discovery thread per endpoint that logs the peer
//!   address once it is learnt and exits.
//!
//! Shutdown is best-effort: the running flag stops every loop at its
//! next iteration boundary and receive threads wake via their socket
//! read timeout.

use std::io::ErrorKind;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;

use tracing::{debug, error, info, warn};

use crate::config::{EndpointConfig, KeyConfig};
use crate::constants::{MAX_DATAGRAM_SIZE, TICK_INTERVAL_MS};
use crate::error::Result;
use crate::net::endpoint::{Endpoint, PeerStatus};
use crate::net::tunnel::{Decrypted, Tunnel};
use crate::net::PacketSink;

/// How often discovery threads poll for a learnt peer address
const DISCOVERY_POLL: Duration = Duration::from_millis(100);

struct Shared {
    tunnel: Tunnel,
    endpoints: Vec<Endpoint>,
    running: AtomicBool,
    sink: Arc<dyn PacketSink>,
}

pub struct SecureTransport {
    shared: Arc<Shared>,
    threads: Vec<JoinHandle<()>>,
}

impl SecureTransport {
    /// Build the tunnel and endpoints, then start all transport threads.
    pub fn spawn(
        endpoint_configs: &[EndpointConfig],
        keys: &KeyConfig,
        sink: Arc<dyn PacketSink>,
    ) -> Result<Self> {
        let tunnel = Tunnel::new(keys)?;
        let mut endpoints = Vec::with_capacity(endpoint_configs.len());
        for (index, config) in endpoint_configs.iter().enumerate() {
            endpoints.push(Endpoint::bind(index, config)?);
        }

        let shared = Arc::new(Shared {
            tunnel,
            endpoints,
            running: AtomicBool::new(true),
            sink,
        });

        let mut threads = Vec::new();
        for index in 0..shared.endpoints.len() {
            let recv_shared = shared.clone();
            threads.push(
                thread::Builder::new()
                    .name(format!("recv-ep{index}"))
                    .spawn(move || recv_shared.recv_loop(index))
                    .expect("spawn receive thread"),
            );
            let disco_shared = shared.clone();
            threads.push(
                thread::Builder::new()
                    .name(format!("disco-ep{index}"))
                    .spawn(move || disco_shared.discovery_loop(index))
                    .expect("spawn discovery thread"),
            );
        }
        let tick_shared = shared.clone();
        threads.push(
            thread::Builder::new()
                .name("wg-tick".into())
                .spawn(move || tick_shared.tick_loop())
                .expect("spawn tick thread"),
        );

        Ok(Self { shared, threads })
    }

    /// Encrypt one payload and broadcast the ciphertext to every path.
    pub fn send(&self, payload: &[u8]) -> Result<()> {
        let mut scratch = [0u8; MAX_DATAGRAM_SIZE];
        if let Some(datagram) = self.shared.tunnel.encrypt(payload, &mut scratch)? {
            self.shared.send_to_all(datagram);
        }
        Ok(())
    }

    /// Stop all threads. Receive threads exit at their next socket
    /// timeout; nothing waits on in-flight packets.
    pub fn shutdown(mut self) {
        self.shared.running.store(false, Ordering::Relaxed);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Drop for SecureTransport {
    fn drop(&mut self) {
        self.shared.running.store(false, Ordering::Relaxed);
        for handle in self.threads.drain(..) {
            let _ = handle.join();
        }
    }
}

impl Shared {
    fn send_to_all(&self, datagram: &[u8]) {
        for endpoint in &self.endpoints {
            endpoint.send_to_peer(datagram);
        }
    }

    fn recv_loop(&self, index: usize) {
        let endpoint = &self.endpoints[index];
        let mut datagram = [0u8; MAX_DATAGRAM_SIZE];
        // Every receive thread owns its scratch buffer, so concurrent
        // decrypts never share cleartext memory.
        let mut scratch = [0u8; MAX_DATAGRAM_SIZE];

        while self.running.load(Ordering::Relaxed) {
            let (len, src) = match endpoint.recv_from(&mut datagram) {
                Ok(received) => received,
                Err(e) if matches!(e.kind(), ErrorKind::WouldBlock | ErrorKind::TimedOut) => {
                    continue;
                }
                Err(e) => {
                    if self.running.load(Ordering::Relaxed) {
                        error!(endpoint = index, error = %e, "receive failed");
                        thread::sleep(Duration::from_millis(10));
                    }
                    continue;
                }
            };
            endpoint.note_received(len);
            let status = endpoint.observe(src);

            let mut authenticated = false;
            let mut input: &[u8] = &datagram[..len];
            loop {
                match self.tunnel.decrypt(input, &mut scratch) {
                    Decrypted::Payload(payload) => {
                        authenticated = true;
                        self.sink.on_packet(payload, index);
                        break;
                    }
                    Decrypted::Respond(response) => {
                        authenticated = true;
                        self.send_to_all(response);
                        input = &[];
                    }
                    Decrypted::Done => break,
                }
            }

            if authenticated && status == PeerStatus::Foreign {
                endpoint.promote(src);
            }
        }
        debug!(endpoint = index, "receive thread stopped");
    }

    fn discovery_loop(&self, index: usize) {
        while self.running.load(Ordering::Relaxed) {
            if let Some(peer) = self.endpoints[index].peer() {
                info!(
                    endpoint = index,
                    interface = self.endpoints[index].interface(),
                    peer = %peer,
                    "peer address discovered"
                );
                return;
            }
            thread::sleep(DISCOVERY_POLL);
        }
    }

    fn tick_loop(&self) {
        // The tick path contends with every receive thread for the
        // tunnel lock, and the handshake timer must not be starved
        // under load.
        elevate_to_realtime();
        let mut scratch = [0u8; MAX_DATAGRAM_SIZE];
        while self.running.load(Ordering::Relaxed) {
            if let Some(datagram) = self.tunnel.tick(&mut scratch) {
                self.send_to_all(datagram);
            }
            thread::sleep(Duration::from_millis(TICK_INTERVAL_MS));
        }
    }
}

#[cfg(target_os = "linux")]
fn elevate_to_realtime() {
    // SAFETY: plain libc calls on the current thread; no memory handed over.
    unsafe {
        let param = libc::sched_param { sched_priority: 98 };
        let rc = libc::pthread_setschedparam(libc::pthread_self(), libc::SCHED_FIFO, &param);
        if rc != 0 {
            warn!(rc, "could not elevate tick thread to realtime priority");
        }
    }
}

#[cfg(not(target_os = "linux"))]
fn elevate_to_realtime() {
    warn!("tick thread realtime elevation is only implemented on Linux");
}
