//! Serial protocol engine
//!
//! Implements the PropDAQ framed serial protocol: escaped, checksummed
//! frames carrying either low-rate control packets or high-rate
//! bit-packed stream packets, plus the link/session management around
//! them.

pub mod clock;
pub mod codec;
mod connection;
mod error;
mod message;
pub mod packet;
pub mod registry;
pub mod scanner;
pub mod serial;

pub use clock::ClockSync;
pub use connection::{Link, LinkConfig, LinkState};
pub use error::ProtocolError;
pub use message::Message;
pub use packet::{ControlPacket, StreamPacket};
pub use registry::{ControlGuard, ControlHandler, Registry, StreamListener};
pub use serial::{list_ports, PortInfo};

/// End-of-packet marker byte
pub const EOP: u8 = b'|';

/// Escape prefix byte
pub const ESC: u8 = b'`';

/// Number of independent sample streams the device can produce
pub const STREAM_COUNT: usize = 8;

/// Default baud rate for device communication
pub const DEFAULT_BAUD_RATE: u32 = 115200;

/// Default per-port response wait during discovery, in milliseconds
pub const DEFAULT_PROBE_TIMEOUT_MS: u64 = 500;

/// Default settle delay after opening a port, in milliseconds.
/// Opening the port toggles the control lines and resets the device;
/// it needs a moment to boot before it will answer.
pub const DEFAULT_OPEN_SETTLE_MS: u64 = 3000;

/// Device clock rate in ticks per second
pub const CLOCK_HZ: u64 = 80_000_000;

/// Expected device ticks between consecutive sync packets
pub const SYNC_PERIOD_TICKS: u64 = 80_000_000;

/// Tolerated deviation from the expected sync period, in ticks
pub const CLOCK_ERROR_TICKS: u64 = 20_000;

/// Highest value of the device's 32-bit tick counter. The rollover
/// arithmetic throughout the clock engine uses this value (2^32 - 1,
/// not 2^32) to match the device firmware.
pub const MAX_TICK: u64 = u32::MAX as u64;
