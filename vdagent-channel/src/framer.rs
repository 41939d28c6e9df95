//! Chunking and reassembly of logical agent messages
//!
//! A logical message is the 20-octet agent header followed by its body. On
//! the carrier it travels as a run of chunks of at most
//! [`VD_AGENT_MAX_DATA_SIZE`] octets; only the first chunk carries the
//! header. Chunks of one message are contiguous and ordered, so reassembly
//! is a two-state fill: header first, then exactly `size` octets of body.

use byteorder::{ByteOrder, LittleEndian};
use thiserror::Error;

use crate::protocol::{AGENT_HEADER_LEN, VD_AGENT_MAX_DATA_SIZE, VD_AGENT_PROTOCOL};

/// Ceiling on the advertised body size of a single reassembled message.
pub const DEFAULT_MAX_MESSAGE_SIZE: usize = 64 * 1024 * 1024;

#[derive(Debug, Error, PartialEq, Eq)]
pub enum FramerError {
    #[error("agent header advertises protocol {0}, expected {VD_AGENT_PROTOCOL}")]
    ProtocolMismatch(u32),

    #[error("agent message of {0} octets exceeds the reassembly ceiling")]
    MessageTooLarge(u32),
}

/// One reassembled logical message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AgentEnvelope {
    pub kind: u32,
    pub opaque: u64,
    pub body: Vec<u8>,
}

fn encode_header(kind: u32, size: u32) -> [u8; AGENT_HEADER_LEN] {
    let mut out = [0u8; AGENT_HEADER_LEN];
    LittleEndian::write_u32(&mut out[0..4], VD_AGENT_PROTOCOL);
    LittleEndian::write_u32(&mut out[4..8], kind);
    LittleEndian::write_u64(&mut out[8..16], 0);
    LittleEndian::write_u32(&mut out[16..20], size);
    out
}

/// Serialize one logical message into its carrier chunks.
///
/// The header counts against the first chunk's budget, continuation chunks
/// are raw body and the trailing chunk may be short. An empty body still
/// produces one chunk so the peer sees the header.
pub fn encode_chunks(kind: u32, body: &[u8]) -> Vec<Vec<u8>> {
    let mut wire = Vec::with_capacity(AGENT_HEADER_LEN + body.len());
    wire.extend_from_slice(&encode_header(kind, body.len() as u32));
    wire.extend_from_slice(body);

    wire.chunks(VD_AGENT_MAX_DATA_SIZE).map(Vec::from).collect()
}

/// Incremental reassembly of inbound chunks into logical messages.
///
/// One instance per channel; [`Reassembler::reset`] drops any partial
/// message when the channel reconnects.
pub struct Reassembler {
    max_message: usize,
    header: Vec<u8>,
    kind: u32,
    opaque: u64,
    expected: usize,
    body: Vec<u8>,
}

impl Default for Reassembler {
    fn default() -> Self {
        Self::new(DEFAULT_MAX_MESSAGE_SIZE)
    }
}

impl Reassembler {
    pub fn new(max_message: usize) -> Self {
        Self {
            max_message,
            header: Vec::with_capacity(AGENT_HEADER_LEN),
            kind: 0,
            opaque: 0,
            expected: 0,
            body: Vec::new(),
        }
    }

    pub fn reset(&mut self) {
        self.header.clear();
        self.body = Vec::new();
        self.expected = 0;
    }

    /// Feed carrier payload octets, emitting every message completed by
    /// them. A failure is fatal to the channel; the reassembler holds no
    /// usable state afterwards.
    pub fn feed(&mut self, mut bytes: &[u8]) -> Result<Vec<AgentEnvelope>, FramerError> {
        let mut out = Vec::new();

        loop {
            if self.header.len() < AGENT_HEADER_LEN {
                if bytes.is_empty() {
                    break;
                }

                let n = (AGENT_HEADER_LEN - self.header.len()).min(bytes.len());
                self.header.extend_from_slice(&bytes[..n]);
                bytes = &bytes[n..];

                if self.header.len() < AGENT_HEADER_LEN {
                    break;
                }

                let protocol = LittleEndian::read_u32(&self.header[0..4]);
                if protocol != VD_AGENT_PROTOCOL {
                    return Err(FramerError::ProtocolMismatch(protocol));
                }

                self.kind = LittleEndian::read_u32(&self.header[4..8]);
                self.opaque = LittleEndian::read_u64(&self.header[8..16]);
                let size = LittleEndian::read_u32(&self.header[16..20]);
                if size as usize > self.max_message {
                    return Err(FramerError::MessageTooLarge(size));
                }
                self.expected = size as usize;
                self.body = Vec::with_capacity(self.expected);
            }

            let n = (self.expected - self.body.len()).min(bytes.len());
            self.body.extend_from_slice(&bytes[..n]);
            bytes = &bytes[n..];

            if self.body.len() < self.expected {
                break;
            }

            out.push(AgentEnvelope {
                kind: self.kind,
                opaque: self.opaque,
                body: std::mem::take(&mut self.body),
            });
            self.header.clear();
        }

        Ok(out)
    }
}
