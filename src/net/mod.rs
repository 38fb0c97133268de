//! Secure multi-endpoint transport
//!
//! One WireGuard tunnel shared by N UDP paths, each bound to its own
//! local interface. Outbound traffic is encrypted once and broadcast to
//! every path; inbound datagrams from any path decrypt through the same
//! session, so duplicates collapse into a single cleartext stream.

pub mod endpoint;
pub mod transport;
pub mod tunnel;

pub use transport::SecureTransport;
pub use tunnel::Tunnel;

/// Consumes cleartext payloads delivered by the transport.
///
/// Called from every receive thread; implementations serialise
/// internally where they must.
pub trait PacketSink: Send + Sync {
    fn on_packet(&self, buf: &[u8], ep_index: usize);
}
