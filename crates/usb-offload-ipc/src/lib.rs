//! Host ↔ coprocessor contract for USB transfer offload.
//!
//! - [`layout`]: sizes, message ids and the shared staging region conventions
//! - [`protocol`]: frame header plus command/event encodings
//! - [`bundle`]: descriptor bundle and ring snapshot blobs staged through the shared region
//! - [`mailbox`]: lock-free fixed-frame FIFO used for both directions

pub mod bundle;
pub mod layout;
pub mod mailbox;
pub mod protocol;

pub use bundle::{DescriptorBundle, RingCursor, RingSnapshot};
pub use mailbox::{Frame, Mailbox};
pub use protocol::{
    decode_command, decode_event, encode_command, encode_event, parse_header, Command,
    DecodeError, EndpointKind, Event, Header, RegionRef, SubmitRequest, WireStatus,
};
