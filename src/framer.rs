//! SLIP byte-stream framer
//!
//! FEC blocks carry a continuous byte stream of SLIP-framed codec
//! packets: `0xC0` delimits packets, `0xDB 0xDC` escapes a literal
//! `0xC0`, `0xDB 0xDD` escapes a literal `0xDB`. The framer accumulates
//! bytes across block boundaries and emits each completed packet.
//!
//! Any protocol violation (unknown escape, oversized packet) abandons the
//! packet in progress. The demux also resets the framer when it observes
//! a forward block jump, since the next block starts mid-packet.

pub const END: u8 = 0xC0;
pub const ESC: u8 = 0xDB;
pub const ESC_END: u8 = 0xDC;
pub const ESC_ESC: u8 = 0xDD;

pub struct SlipFramer {
    accum: Vec<u8>,
    max_packet_size: usize,
    esc_active: bool,
}

impl SlipFramer {
    pub fn new(max_packet_size: usize) -> Self {
        Self {
            accum: Vec::with_capacity(max_packet_size),
            max_packet_size,
            esc_active: false,
        }
    }

    /// Drop the packet in progress
    pub fn reset(&mut self) {
        self.accum.clear();
        self.esc_active = false;
    }

    /// Feed one payload slab, invoking `packet` for each completed frame
    pub fn feed(&mut self, slab: &[u8], mut packet: impl FnMut(&[u8])) {
        for &byte in slab {
            if self.esc_active {
                self.esc_active = false;
                let literal = match byte {
                    ESC_END => END,
                    ESC_ESC => ESC,
                    _ => {
                        self.reset();
                        continue;
                    }
                };
                self.push(literal);
                continue;
            }

            match byte {
                END => {
                    if !self.accum.is_empty() {
                        packet(&self.accum);
                        self.accum.clear();
                    }
                }
                ESC => self.esc_active = true,
                _ => self.push(byte),
            }
        }
    }

    fn push(&mut self, byte: u8) {
        if self.accum.len() >= self.max_packet_size {
            self.reset();
            return;
        }
        self.accum.push(byte);
    }
}

/// SLIP-encode one packet, without the trailing delimiter
pub fn encode(packet: &[u8], out: &mut Vec<u8>) {
    for &byte in packet {
        match byte {
            END => out.extend_from_slice(&[ESC, ESC_END]),
            ESC => out.extend_from_slice(&[ESC, ESC_ESC]),
            _ => out.push(byte),
        }
    }
}
