//! WireGuard tunnel adapter
//!
//! Exactly one tunnel session exists per process; every endpoint
//! encrypts and decrypts through it. BoringTun validates the inner
//! packet as IP, so outbound payloads are wrapped in a minimal synthetic
//! IPv4 header that the receiving side strips again.
//!
//! All receive threads and the tick thread contend on the internal lock;
//! the lock is held only for the cryptographic operation itself, never
//! while downstream code runs.

use std::sync::Mutex;

use boringtun::noise::errors::WireGuardError;
use boringtun::noise::{Tunn, TunnResult};
use boringtun::x25519::{PublicKey, StaticSecret};
use tracing::debug;

use crate::config::{decode_x25519_key, KeyConfig};
use crate::constants::IPV4_HEADER_LEN;
use crate::error::{NetworkError, Result};

/// Keepalives hold NAT mappings open on every path
const KEEPALIVE_INTERVAL_SECS: u16 = 10;

/// Outcome of one decryption step
pub enum Decrypted<'a> {
    /// Cleartext payload, synthetic IPv4 header already stripped
    Payload(&'a [u8]),
    /// Handshake or keepalive bytes that must be broadcast to the peer;
    /// call [`Tunnel::decrypt`] again with an empty datagram to drain
    Respond(&'a [u8]),
    /// Nothing further to do for this datagram
    Done,
}

/// The process-wide Noise session
pub struct Tunnel {
    tunn: Mutex<Tunn>,
}

impl Tunnel {
    pub fn new(keys: &KeyConfig) -> Result<Self> {
        let private = StaticSecret::from(decode_x25519_key(&keys.private_key)?);
        let peer_public = PublicKey::from(decode_x25519_key(&keys.peer_public_key)?);
        let tunn = Tunn::new(
            private,
            peer_public,
            None,
            Some(KEEPALIVE_INTERVAL_SECS),
            0,
            None,
        )
        .map_err(|e| NetworkError::TunnelInit(e.to_string()))?;
        Ok(Self {
            tunn: Mutex::new(tunn),
        })
    }

    /// Encrypt one payload. Returns the ciphertext datagram to broadcast,
    /// or `None` when the tunnel has nothing to emit yet (no handshake).
    pub fn encrypt<'a>(&self, payload: &[u8], scratch: &'a mut [u8]) -> Result<Option<&'a [u8]>> {
        let mut inner = [0u8; crate::constants::MAX_DATAGRAM_SIZE];
        let total = payload.len() + IPV4_HEADER_LEN;
        if total > inner.len() {
            return Err(NetworkError::PayloadTooLarge(payload.len()).into());
        }

        // Synthetic IPv4 header: version 4, IHL 5, total length filled in.
        // BoringTun checks nothing else before encapsulating.
        inner[0] = 0x45;
        inner[2] = (total >> 8) as u8;
        inner[3] = (total & 0xff) as u8;
        inner[IPV4_HEADER_LEN..total].copy_from_slice(payload);

        let mut tunn = self.tunn.lock().unwrap_or_else(|e| e.into_inner());
        match tunn.encapsulate(&inner[..total], scratch) {
            TunnResult::WriteToNetwork(packet) if !packet.is_empty() => Ok(Some(packet)),
            TunnResult::Err(e) => {
                debug!(error = ?e, "tunnel write error");
                Ok(None)
            }
            _ => Ok(None),
        }
    }

    /// Run one decryption step for an inbound datagram.
    pub fn decrypt<'a>(&self, datagram: &[u8], scratch: &'a mut [u8]) -> Decrypted<'a> {
        let result = {
            let mut tunn = self.tunn.lock().unwrap_or_else(|e| e.into_inner());
            tunn.decapsulate(None, datagram, scratch)
        };
        match result {
            TunnResult::WriteToTunnelV4(packet, _) if packet.len() > IPV4_HEADER_LEN => {
                Decrypted::Payload(&packet[IPV4_HEADER_LEN..])
            }
            TunnResult::WriteToNetwork(packet) => Decrypted::Respond(packet),
            TunnResult::Err(WireGuardError::DuplicateCounter) => {
                // Redundant paths replay the same counters constantly;
                // this is the expected fate of every duplicate datagram.
                Decrypted::Done
            }
            TunnResult::Err(e) => {
                debug!(error = ?e, "tunnel read error");
                Decrypted::Done
            }
            _ => Decrypted::Done,
        }
    }

    /// Advance the session timers. Returns keepalive/handshake bytes to
    /// broadcast, if the timer produced any.
    pub fn tick<'a>(&self, scratch: &'a mut [u8]) -> Option<&'a [u8]> {
        let result = {
            let mut tunn = self.tunn.lock().unwrap_or_else(|e| e.into_inner());
            tunn.update_timers(scratch)
        };
        match result {
            TunnResult::WriteToNetwork(packet) if !packet.is_empty() => Some(packet),
            TunnResult::Err(e) => {
                debug!(error = ?e, "tunnel tick error");
                None
            }
            _ => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::constants::MAX_DATAGRAM_SIZE;

    fn test_keys() -> (KeyConfig, KeyConfig) {
        use base64::{engine::general_purpose::STANDARD, Engine as _};

        let a = StaticSecret::from([0x11u8; 32]);
        let b = StaticSecret::from([0x22u8; 32]);
        let a_pub = PublicKey::from(&a);
        let b_pub = PublicKey::from(&b);
        let receiver = KeyConfig {
            private_key: STANDARD.encode(a.to_bytes()),
            peer_public_key: STANDARD.encode(b_pub.as_bytes()),
        };
        let sender = KeyConfig {
            private_key: STANDARD.encode(b.to_bytes()),
            peer_public_key: STANDARD.encode(a_pub.as_bytes()),
        };
        (receiver, sender)
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let (receiver, _) = test_keys();
        let tunnel = Tunnel::new(&receiver).unwrap();
        let mut scratch = [0u8; MAX_DATAGRAM_SIZE];
        let payload = vec![0u8; MAX_DATAGRAM_SIZE];
        assert!(tunnel.encrypt(&payload, &mut scratch).is_err());
    }

    /// Feed one datagram through a tunnel, collecting everything it wants
    /// sent back out on the network.
    fn drain(tunnel: &Tunnel, datagram: &[u8], network_out: &mut Vec<Vec<u8>>) {
        let mut input: &[u8] = datagram;
        loop {
            let mut scratch = [0u8; MAX_DATAGRAM_SIZE];
            match tunnel.decrypt(input, &mut scratch) {
                Decrypted::Respond(p) => {
                    network_out.push(p.to_vec());
                    input = &[];
                }
                Decrypted::Payload(_) | Decrypted::Done => break,
            }
        }
    }

    #[test]
    fn round_trip_through_paired_tunnels() {
        let (receiver_keys, sender_keys) = test_keys();
        let receiver = Tunnel::new(&receiver_keys).unwrap();
        let sender = Tunnel::new(&sender_keys).unwrap();

        // Kick off the handshake and shuttle datagrams both ways until
        // the link goes quiet.
        let mut to_receiver: Vec<Vec<u8>> = Vec::new();
        let mut to_sender: Vec<Vec<u8>> = Vec::new();
        let mut scratch = [0u8; MAX_DATAGRAM_SIZE];
        if let Some(p) = sender.encrypt(b"probe", &mut scratch).unwrap() {
            to_receiver.push(p.to_vec());
        }
        for _ in 0..16 {
            if to_receiver.is_empty() && to_sender.is_empty() {
                break;
            }
            if let Some(datagram) = to_receiver.pop() {
                drain(&receiver, &datagram, &mut to_sender);
            }
            if let Some(datagram) = to_sender.pop() {
                drain(&sender, &datagram, &mut to_receiver);
            }
        }

        // Session established: data flows and the synthetic header is
        // stripped on the way out.
        let mut scratch = [0u8; MAX_DATAGRAM_SIZE];
        let ciphertext = sender
            .encrypt(b"pcm-bytes", &mut scratch)
            .unwrap()
            .expect("established tunnel emits data")
            .to_vec();
        let mut read_scratch = [0u8; MAX_DATAGRAM_SIZE];
        match receiver.decrypt(&ciphertext, &mut read_scratch) {
            Decrypted::Payload(p) => assert_eq!(p, b"pcm-bytes"),
            _ => panic!("expected payload"),
        }
    }
}
