pub mod event_parsing;
pub mod logs;

pub use event_parsing::{EventParam, EventParseError, ParsedEvent};
pub use logs::{decode_log, DecodeError};
