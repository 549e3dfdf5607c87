//! Ping Protocol Communication
//!
//! Implements the binary "Ping" protocol spoken by Ping1D sonar rangefinders:
//! framing and checksums, the typed message catalogue, per-id request
//! tracking, and the transport channels the engine writes through.

mod error;
pub mod messages;
mod packet;
pub mod serial;
pub mod stream;
mod tracker;

pub use error::ProtocolError;
pub use messages::{Message, MessageId};
pub use packet::{checksum, decode, Decoded, Packet, PacketBuilder, PacketParser};
pub use serial::{list_ports, open_port, PortInfo};
pub use stream::{CommunicationChannel, SerialChannel, TcpChannel};
pub use tracker::{ReplyMatch, RequestStatus, RequestTracker};

/// Default baud rate for normal sonar operation
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Default window a request may stay unanswered before it counts as lost
pub const DEFAULT_TIMEOUT_MS: u64 = 1000;

/// Largest payload the parser accepts before treating a header as corrupt
pub const MAX_PAYLOAD_SIZE: usize = 8192;

/// Frame start bytes
pub const START_BYTES: [u8; 2] = [b'B', b'R'];

/// Bytes before the payload: start(2) + length(2) + id(2) + src(1) + dst(1)
pub const HEADER_SIZE: usize = 8;

/// Trailing checksum size
pub const CHECKSUM_SIZE: usize = 2;
