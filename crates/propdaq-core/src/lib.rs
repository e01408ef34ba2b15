//! # PropDAQ Core Library
//!
//! Host-side driver for PropDAQ data-acquisition hardware.
//!
//! This library provides:
//! - Framed, checksummed, escaped serial protocol (codec + incremental
//!   frame scanner)
//! - Control-packet and bit-packed stream-packet decoding
//! - Device clock synchronization with rollover and drift handling
//! - A callback/listener dispatch registry
//! - Link management with a background reader thread and first-responder
//!   port discovery
//!
//! ## Example
//!
//! ```rust,ignore
//! use propdaq_core::protocol::{Link, LinkConfig, Message};
//!
//! let link = Link::new(LinkConfig::default());
//! link.open(Some("/dev/ttyUSB0"))?;
//! link.send(Message::Start, &[3])?;
//! ```

#![warn(missing_docs)]

pub mod protocol;

/// Re-export commonly used types
pub mod prelude {
    pub use crate::protocol::{
        ControlPacket, Link, LinkConfig, LinkState, Message, ProtocolError, StreamListener,
        StreamPacket,
    };
}
