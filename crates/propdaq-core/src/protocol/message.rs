//! Control message name table
//!
//! The wire message id of a control packet is an index into a fixed
//! name table shared with the device firmware. The table is closed:
//! every id the engine understands is a variant here, resolved once at
//! the decode boundary and matched exhaustively afterwards.

use std::fmt;

/// A control message kind. The discriminant is the wire message id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u8)]
#[allow(missing_docs)]
pub enum Message {
    Talk = 0,
    Over = 1,
    Bad = 2,
    Version = 3,
    Start = 4,
    Stop = 5,
    Set = 6,
    Dir = 7,
    Query = 8,
    Info = 9,
    Dig = 10,
    Wav = 11,
    Point = 12,
    Sync = 13,
    Avg = 14,
    Timer = 15,
    Event = 16,
    ResetEvents = 17,
    Trigger = 18,
}

/// All message kinds, ordered by wire id.
const TABLE: [Message; 19] = [
    Message::Talk,
    Message::Over,
    Message::Bad,
    Message::Version,
    Message::Start,
    Message::Stop,
    Message::Set,
    Message::Dir,
    Message::Query,
    Message::Info,
    Message::Dig,
    Message::Wav,
    Message::Point,
    Message::Sync,
    Message::Avg,
    Message::Timer,
    Message::Event,
    Message::ResetEvents,
    Message::Trigger,
];

impl Message {
    /// Resolve a wire message id to a message kind.
    pub fn from_id(id: u8) -> Option<Self> {
        TABLE.get(id as usize).copied()
    }

    /// Resolve a message name to a message kind. Names are the
    /// lowercase identifiers used by the device firmware.
    pub fn from_name(name: &str) -> Option<Self> {
        TABLE.iter().copied().find(|m| m.name() == name)
    }

    /// Wire message id of this kind.
    pub fn id(self) -> u8 {
        self as u8
    }

    /// Firmware name of this kind.
    pub fn name(self) -> &'static str {
        match self {
            Message::Talk => "talk",
            Message::Over => "over",
            Message::Bad => "bad",
            Message::Version => "version",
            Message::Start => "start",
            Message::Stop => "stop",
            Message::Set => "set",
            Message::Dir => "dir",
            Message::Query => "query",
            Message::Info => "info",
            Message::Dig => "dig",
            Message::Wav => "wav",
            Message::Point => "point",
            Message::Sync => "sync",
            Message::Avg => "avg",
            Message::Timer => "timer",
            Message::Event => "event",
            Message::ResetEvents => "resetevents",
            Message::Trigger => "trigger",
        }
    }

    /// Whether packets of this kind are kept out of verbose control
    /// tracing. Sync packets arrive once a second for the whole life
    /// of a session and would drown everything else.
    pub(crate) fn traced(self) -> bool {
        self != Message::Sync
    }
}

impl fmt::Display for Message {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}
