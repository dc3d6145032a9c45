//! Framed binary serial protocol spoken between the voz bridge and its
//! embedded host.
//!
//! Every frame on the wire is
//! `SOH | header(5) | header checksum | payload | payload checksum`,
//! with the header packed little-endian and 1-byte aligned. The codec here
//! carries no I/O policy beyond `std::io::{Read, Write}`; timeouts and
//! polling belong to the caller.

mod event;
mod frame;

pub use event::{
    AudioConf, Event, EventId, StatusReport, WwConf, WwEntryStatus, WwMatch, WW_NAME_LEN,
};
pub use frame::{checksum, read_event, write_event, FrameError, MAX_PAYLOAD, SOH};
