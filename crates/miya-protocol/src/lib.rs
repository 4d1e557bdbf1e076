//! MIYA HRV RS-485 protocol over TCP
//!
//! This crate implements the fixed-length binary protocol spoken by MIYA
//! heat-recovery ventilation controllers, carried over an RS-485-to-TCP
//! bridge: CRC16 framing, the command catalog, status decoding, and a
//! reconnecting transport.

pub mod commands;
pub mod crc;
pub mod frame;
pub mod framer;
pub mod hexfmt;
pub mod queue;
pub mod status;
pub mod subscribers;
pub mod transport;
pub mod types;

pub use commands::{CommandTable, CommandTemplate, ControlFrame, CATALOG};
pub use frame::{decode_frame, resolve_command, FrameView, StandardFrame};
pub use framer::FrameAssembler;
pub use hexfmt::{decode_hex, encode_hex};
pub use status::{
    interpret, FanMode, FieldChange, PowerMode, StatusSnapshot, Toggle, Unsupported,
};
pub use subscribers::{SubscriberError, SubscriberRegistry, SubscriptionId};
pub use transport::{
    ConnectionInfo, ConnectionState, ReceivedFrame, ReconnectPolicy, TcpTransport,
    TransportConfig, TransportEvent, TransportStats,
};
pub use types::*;
