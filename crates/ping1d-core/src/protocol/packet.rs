//! Packet encoding/decoding
//!
//! Implements the binary frame format of the Ping protocol.
//!
//! Frame format (all fields little-endian):
//! - 2 bytes: start bytes `'B' 'R'`
//! - 2 bytes: payload length
//! - 2 bytes: message id
//! - 1 byte: source device id
//! - 1 byte: destination device id
//! - N bytes: payload
//! - 2 bytes: checksum (wrapping sum of every preceding byte)

use byteorder::{ByteOrder, LittleEndian};

use super::{ProtocolError, CHECKSUM_SIZE, HEADER_SIZE, MAX_PAYLOAD_SIZE, START_BYTES};

/// A protocol packet
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Packet {
    /// Message id
    pub message_id: u16,
    /// Source device id
    pub src_device_id: u8,
    /// Destination device id
    pub dst_device_id: u8,
    /// Packet payload
    pub payload: Vec<u8>,
    /// Checksum over header and payload
    pub checksum: u16,
}

impl Packet {
    /// Create a new packet with the given id and payload
    pub fn new(message_id: u16, payload: Vec<u8>) -> Self {
        Self::addressed(message_id, 0, 0, payload)
    }

    /// Create a new packet with explicit source and destination ids
    pub fn addressed(message_id: u16, src_device_id: u8, dst_device_id: u8, payload: Vec<u8>) -> Self {
        let mut packet = Self {
            message_id,
            src_device_id,
            dst_device_id,
            payload,
            checksum: 0,
        };
        packet.checksum = checksum(&packet.header_and_payload());
        packet
    }

    /// Decode a packet from exactly one raw frame
    pub fn from_bytes(data: &[u8]) -> Result<Self, ProtocolError> {
        if data.len() < HEADER_SIZE + CHECKSUM_SIZE || data[0..2] != START_BYTES {
            return Err(ProtocolError::MalformedFrame("missing frame header".into()));
        }

        let length = LittleEndian::read_u16(&data[2..4]) as usize;
        if length > MAX_PAYLOAD_SIZE {
            return Err(ProtocolError::BufferOverflow(length));
        }

        let frame_len = HEADER_SIZE + length + CHECKSUM_SIZE;
        if data.len() != frame_len {
            return Err(ProtocolError::MalformedFrame(format!(
                "expected {} bytes, got {}",
                frame_len,
                data.len()
            )));
        }

        let expected = checksum(&data[..HEADER_SIZE + length]);
        let actual = LittleEndian::read_u16(&data[HEADER_SIZE + length..]);
        if expected != actual {
            return Err(ProtocolError::ChecksumMismatch { expected, actual });
        }

        Ok(Self {
            message_id: LittleEndian::read_u16(&data[4..6]),
            src_device_id: data[6],
            dst_device_id: data[7],
            payload: data[HEADER_SIZE..HEADER_SIZE + length].to_vec(),
            checksum: actual,
        })
    }

    /// Encode the packet to raw bytes
    ///
    /// The checksum is always recomputed from the header and payload, never
    /// taken from the `checksum` field. Payloads over [`MAX_PAYLOAD_SIZE`]
    /// are rejected by the decoder, so callers must check before encoding.
    pub fn to_bytes(&self) -> Vec<u8> {
        debug_assert!(
            self.payload.len() <= MAX_PAYLOAD_SIZE,
            "payload of {} bytes exceeds the frame limit",
            self.payload.len()
        );
        let mut bytes = self.header_and_payload();
        let mut crc_bytes = [0u8; 2];
        LittleEndian::write_u16(&mut crc_bytes, checksum(&bytes));
        bytes.extend_from_slice(&crc_bytes);
        bytes
    }

    /// Get the total encoded size
    pub fn encoded_size(&self) -> usize {
        HEADER_SIZE + self.payload.len() + CHECKSUM_SIZE
    }

    fn header_and_payload(&self) -> Vec<u8> {
        let mut bytes = Vec::with_capacity(self.encoded_size());
        bytes.extend_from_slice(&START_BYTES);

        let mut word = [0u8; 2];
        LittleEndian::write_u16(&mut word, self.payload.len() as u16);
        bytes.extend_from_slice(&word);
        LittleEndian::write_u16(&mut word, self.message_id);
        bytes.extend_from_slice(&word);

        bytes.push(self.src_device_id);
        bytes.push(self.dst_device_id);
        bytes.extend_from_slice(&self.payload);
        bytes
    }
}

/// Builder for constructing packets
pub struct PacketBuilder {
    message_id: u16,
    src_device_id: u8,
    dst_device_id: u8,
    payload: Vec<u8>,
}

impl PacketBuilder {
    /// Create a new packet builder for the given message id
    pub fn new(message_id: u16) -> Self {
        Self {
            message_id,
            src_device_id: 0,
            dst_device_id: 0,
            payload: Vec::new(),
        }
    }

    /// Set the source and destination device ids
    pub fn route(mut self, src_device_id: u8, dst_device_id: u8) -> Self {
        self.src_device_id = src_device_id;
        self.dst_device_id = dst_device_id;
        self
    }

    /// Add a single byte
    pub fn u8(mut self, b: u8) -> Self {
        self.payload.push(b);
        self
    }

    /// Add a 16-bit value (little-endian)
    pub fn u16_le(mut self, value: u16) -> Self {
        let mut bytes = [0u8; 2];
        LittleEndian::write_u16(&mut bytes, value);
        self.payload.extend_from_slice(&bytes);
        self
    }

    /// Add a 32-bit value (little-endian)
    pub fn u32_le(mut self, value: u32) -> Self {
        let mut bytes = [0u8; 4];
        LittleEndian::write_u32(&mut bytes, value);
        self.payload.extend_from_slice(&bytes);
        self
    }

    /// Add raw bytes
    pub fn bytes(mut self, data: &[u8]) -> Self {
        self.payload.extend_from_slice(data);
        self
    }

    /// Build the packet
    pub fn build(self) -> Packet {
        Packet::addressed(
            self.message_id,
            self.src_device_id,
            self.dst_device_id,
            self.payload,
        )
    }
}

/// Wrapping 16-bit sum of all bytes
pub fn checksum(data: &[u8]) -> u16 {
    data.iter()
        .fold(0u16, |sum, b| sum.wrapping_add(u16::from(*b)))
}

/// Result of one decode attempt on a byte buffer
#[derive(Debug)]
pub enum Decoded {
    /// A complete, checksum-valid frame
    Message(Packet),
    /// The buffer holds a partial frame (or nothing); wait for more bytes
    NeedMoreBytes,
    /// The bytes at the front of the buffer are not a valid frame
    Invalid(ProtocolError),
}

/// Try to decode one frame from the start of `data`.
///
/// Returns the outcome and how many bytes of `data` it consumed. Garbage in
/// front of a start marker is consumed silently. A partial frame consumes
/// nothing. A corrupt frame consumes exactly one byte so the next call
/// resynchronizes from the following offset.
pub fn decode(data: &[u8]) -> (Decoded, usize) {
    let skipped = start_offset(data);
    let data = &data[skipped..];

    if data.len() < HEADER_SIZE {
        return (Decoded::NeedMoreBytes, skipped);
    }

    let length = LittleEndian::read_u16(&data[2..4]) as usize;
    if length > MAX_PAYLOAD_SIZE {
        return (
            Decoded::Invalid(ProtocolError::BufferOverflow(length)),
            skipped + 1,
        );
    }

    let frame_len = HEADER_SIZE + length + CHECKSUM_SIZE;
    if data.len() < frame_len {
        return (Decoded::NeedMoreBytes, skipped);
    }

    match Packet::from_bytes(&data[..frame_len]) {
        Ok(packet) => (Decoded::Message(packet), skipped + frame_len),
        Err(e) => (Decoded::Invalid(e), skipped + 1),
    }
}

/// Offset of the first possible frame start in `data`
fn start_offset(data: &[u8]) -> usize {
    let mut offset = 0;
    while offset < data.len() {
        let is_start = data[offset] == START_BYTES[0]
            && (offset + 1 == data.len() || data[offset + 1] == START_BYTES[1]);
        if is_start {
            break;
        }
        offset += 1;
    }
    offset
}

/// Streaming parser that accumulates bytes and yields frames in arrival order
#[derive(Debug, Default)]
pub struct PacketParser {
    buffer: Vec<u8>,
    /// Frames dropped because they failed validation
    pub errors: u32,
    /// Frames decoded successfully
    pub parsed: u32,
}

impl PacketParser {
    /// Create an empty parser
    pub fn new() -> Self {
        Self::default()
    }

    /// Add received data to the buffer
    pub fn push(&mut self, data: &[u8]) {
        self.buffer.extend_from_slice(data);
    }

    /// Decode the next frame from the buffered bytes
    pub fn next_frame(&mut self) -> Decoded {
        let (decoded, consumed) = decode(&self.buffer);
        self.buffer.drain(..consumed);
        match &decoded {
            Decoded::Message(_) => self.parsed += 1,
            Decoded::Invalid(_) => self.errors += 1,
            Decoded::NeedMoreBytes => {}
        }
        decoded
    }

    /// Get the number of buffered bytes
    pub fn buffered_len(&self) -> usize {
        self.buffer.len()
    }

    /// Clear the buffer
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}
