//! Binary message protocol carried over the mailboxes.
//!
//! Every frame starts with a 5-byte header (`id: u16`, `length: u16`, `source_tag: u8`, all
//! little-endian) followed by `length` payload bytes. A frame never exceeds
//! [`MAX_MESSAGE_BYTES`]; anything larger is rejected before it is interpreted.
//!
//! Commands flow host → coprocessor, events flow coprocessor → host. The two id namespaces are
//! disjoint (see [`crate::layout::is_from_coprocessor`]) so a receiver can reject frames that
//! arrive on the wrong side with a single check.

use thiserror::Error;

use crate::layout::{
    from_coprocessor, is_from_coprocessor, source_tag, to_coprocessor, HEADER_BYTES,
    MAX_MESSAGE_BYTES,
};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unexpected end of frame")]
    UnexpectedEof,
    #[error("frame of {0} bytes exceeds the {MAX_MESSAGE_BYTES}-byte limit")]
    OversizedFrame(usize),
    #[error("header declares {declared} payload bytes but frame carries {actual}")]
    LengthMismatch { declared: usize, actual: usize },
    #[error("unknown message id {0:#06x}")]
    UnknownId(u16),
    #[error("invalid enum value {0}")]
    InvalidEnum(u8),
    #[error("payload has {0} trailing bytes")]
    TrailingBytes(usize),
    #[error("bad magic {0:#010x}")]
    BadMagic(u32),
}

/// Decoded frame header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Header {
    pub id: u16,
    pub length: u16,
    pub source_tag: u8,
}

/// Location of a blob inside the shared staging region.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct RegionRef {
    pub offset: u32,
    pub len: u32,
}

impl RegionRef {
    /// "No region"; used by a compensating stop that does not want a ring snapshot back.
    pub const NONE: RegionRef = RegionRef { offset: 0, len: 0 };

    pub fn is_none(&self) -> bool {
        self.len == 0
    }
}

/// Transfer type as encoded on the wire (matches the USB endpoint descriptor encoding).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointKind {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl EndpointKind {
    pub fn to_u8(self) -> u8 {
        match self {
            EndpointKind::Control => 0,
            EndpointKind::Isochronous => 1,
            EndpointKind::Bulk => 2,
            EndpointKind::Interrupt => 3,
        }
    }

    pub fn from_u8(v: u8) -> Result<Self, DecodeError> {
        Ok(match v {
            0 => EndpointKind::Control,
            1 => EndpointKind::Isochronous,
            2 => EndpointKind::Bulk,
            3 => EndpointKind::Interrupt,
            _ => return Err(DecodeError::InvalidEnum(v)),
        })
    }
}

/// Completion status reported by the coprocessor for a submitted transfer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WireStatus {
    Success,
    ShortPacket,
    Cancelled,
    Error,
    NoDevice,
}

impl WireStatus {
    pub fn to_u8(self) -> u8 {
        match self {
            WireStatus::Success => 0,
            WireStatus::ShortPacket => 1,
            WireStatus::Cancelled => 2,
            WireStatus::Error => 3,
            WireStatus::NoDevice => 4,
        }
    }

    pub fn from_u8(v: u8) -> Result<Self, DecodeError> {
        Ok(match v {
            0 => WireStatus::Success,
            1 => WireStatus::ShortPacket,
            2 => WireStatus::Cancelled,
            3 => WireStatus::Error,
            4 => WireStatus::NoDevice,
            _ => return Err(DecodeError::InvalidEnum(v)),
        })
    }
}

/// Payload of a [`Command::Submit`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SubmitRequest {
    /// Correlates the eventual [`Event::TransferDone`] with this request.
    pub tag: u32,
    /// Endpoint address; bit 7 set for IN.
    pub endpoint: u8,
    pub kind: EndpointKind,
    /// Staging slots holding OUT data or receiving IN data.
    pub region: RegionRef,
    /// Requested transfer length in bytes.
    pub length: u32,
    /// Raw SETUP packet; present only for control transfers.
    pub setup: Option<[u8; 8]>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// Hand the endpoint rings to the coprocessor. `bundle` holds an encoded
    /// [`crate::bundle::DescriptorBundle`].
    Start { bundle: RegionRef },
    /// Take the rings back. The coprocessor writes a [`crate::bundle::RingSnapshot`] into
    /// `snapshot` before acknowledging, unless it is [`RegionRef::NONE`].
    Stop { snapshot: RegionRef },
    GetStatus,
    Submit(SubmitRequest),
    /// Stop processing `tag` and drop its staging slots.
    Dequeue { tag: u32, region: RegionRef },
    BusSuspend,
    BusResume,
    Ping { seq: u32 },
}

impl Command {
    pub fn id(&self) -> u16 {
        match self {
            Command::Start { .. } => to_coprocessor::START,
            Command::Stop { .. } => to_coprocessor::STOP,
            Command::GetStatus => to_coprocessor::GET_STATUS,
            Command::Submit(_) => to_coprocessor::SUBMIT,
            Command::Dequeue { .. } => to_coprocessor::DEQUEUE,
            Command::BusSuspend => to_coprocessor::BUS_SUSPEND,
            Command::BusResume => to_coprocessor::BUS_RESUME,
            Command::Ping { .. } => to_coprocessor::PING,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Event {
    /// Common acknowledgement for a synchronous command.
    Ack { id: u16, result: i32 },
    TransferDone {
        tag: u32,
        status: WireStatus,
        actual: u32,
    },
    /// Root port status bits changed on the coprocessor side.
    PortStatus { port: u8, bits: u16 },
    Pong { seq: u32 },
}

impl Event {
    pub fn id(&self) -> u16 {
        match self {
            Event::Ack { .. } => from_coprocessor::ACK,
            Event::TransferDone { .. } => from_coprocessor::XFER_DONE,
            Event::PortStatus { .. } => from_coprocessor::PORT_STATUS,
            Event::Pong { .. } => from_coprocessor::PONG,
        }
    }
}

/// Validates the frame envelope and returns its header.
pub fn parse_header(bytes: &[u8]) -> Result<Header, DecodeError> {
    if bytes.len() > MAX_MESSAGE_BYTES {
        return Err(DecodeError::OversizedFrame(bytes.len()));
    }
    if bytes.len() < HEADER_BYTES {
        return Err(DecodeError::UnexpectedEof);
    }
    let mut r = Reader::new(bytes);
    let header = Header {
        id: r.read_u16()?,
        length: r.read_u16()?,
        source_tag: r.read_u8()?,
    };
    let actual = bytes.len() - HEADER_BYTES;
    if usize::from(header.length) != actual {
        return Err(DecodeError::LengthMismatch {
            declared: usize::from(header.length),
            actual,
        });
    }
    Ok(header)
}

pub fn encode_command(cmd: &Command) -> Vec<u8> {
    let mut w = FrameWriter::new(cmd.id(), source_tag::HOST);
    match cmd {
        Command::Start { bundle } => w.region(*bundle),
        Command::Stop { snapshot } => w.region(*snapshot),
        Command::GetStatus | Command::BusSuspend | Command::BusResume => {}
        Command::Submit(req) => {
            w.u32(req.tag);
            w.u8(req.endpoint);
            w.u8(req.kind.to_u8());
            w.region(req.region);
            w.u32(req.length);
            if let Some(setup) = &req.setup {
                w.bytes(setup);
            }
        }
        Command::Dequeue { tag, region } => {
            w.u32(*tag);
            w.region(*region);
        }
        Command::Ping { seq } => w.u32(*seq),
    }
    w.finish()
}

pub fn encode_event(evt: &Event) -> Vec<u8> {
    let mut w = FrameWriter::new(evt.id(), source_tag::COPROCESSOR);
    match evt {
        Event::Ack { id, result } => {
            w.u16(*id);
            w.u32(*result as u32);
        }
        Event::TransferDone {
            tag,
            status,
            actual,
        } => {
            w.u32(*tag);
            w.u8(status.to_u8());
            w.u32(*actual);
        }
        Event::PortStatus { port, bits } => {
            w.u8(*port);
            w.u16(*bits);
        }
        Event::Pong { seq } => w.u32(*seq),
    }
    w.finish()
}

pub fn decode_command(bytes: &[u8]) -> Result<Command, DecodeError> {
    let header = parse_header(bytes)?;
    if is_from_coprocessor(header.id) {
        return Err(DecodeError::UnknownId(header.id));
    }
    let mut r = Reader::new(&bytes[HEADER_BYTES..]);
    let cmd = match header.id {
        to_coprocessor::START => Command::Start {
            bundle: r.read_region()?,
        },
        to_coprocessor::STOP => Command::Stop {
            snapshot: r.read_region()?,
        },
        to_coprocessor::GET_STATUS => Command::GetStatus,
        to_coprocessor::SUBMIT => {
            let tag = r.read_u32()?;
            let endpoint = r.read_u8()?;
            let kind = EndpointKind::from_u8(r.read_u8()?)?;
            let region = r.read_region()?;
            let length = r.read_u32()?;
            let setup = if kind == EndpointKind::Control {
                let mut raw = [0u8; 8];
                raw.copy_from_slice(r.read_bytes(8)?);
                Some(raw)
            } else {
                None
            };
            Command::Submit(SubmitRequest {
                tag,
                endpoint,
                kind,
                region,
                length,
                setup,
            })
        }
        to_coprocessor::DEQUEUE => Command::Dequeue {
            tag: r.read_u32()?,
            region: r.read_region()?,
        },
        to_coprocessor::BUS_SUSPEND => Command::BusSuspend,
        to_coprocessor::BUS_RESUME => Command::BusResume,
        to_coprocessor::PING => Command::Ping { seq: r.read_u32()? },
        other => return Err(DecodeError::UnknownId(other)),
    };
    r.finish()?;
    Ok(cmd)
}

pub fn decode_event(bytes: &[u8]) -> Result<Event, DecodeError> {
    let header = parse_header(bytes)?;
    if !is_from_coprocessor(header.id) {
        return Err(DecodeError::UnknownId(header.id));
    }
    let mut r = Reader::new(&bytes[HEADER_BYTES..]);
    let evt = match header.id {
        from_coprocessor::ACK => Event::Ack {
            id: r.read_u16()?,
            result: r.read_u32()? as i32,
        },
        from_coprocessor::XFER_DONE => Event::TransferDone {
            tag: r.read_u32()?,
            status: WireStatus::from_u8(r.read_u8()?)?,
            actual: r.read_u32()?,
        },
        from_coprocessor::PORT_STATUS => Event::PortStatus {
            port: r.read_u8()?,
            bits: r.read_u16()?,
        },
        from_coprocessor::PONG => Event::Pong { seq: r.read_u32()? },
        other => return Err(DecodeError::UnknownId(other)),
    };
    r.finish()?;
    Ok(evt)
}

struct FrameWriter {
    out: Vec<u8>,
}

impl FrameWriter {
    fn new(id: u16, source: u8) -> Self {
        let mut out = Vec::with_capacity(MAX_MESSAGE_BYTES);
        out.extend_from_slice(&id.to_le_bytes());
        // Length is patched in `finish`.
        out.extend_from_slice(&[0, 0]);
        out.push(source);
        Self { out }
    }

    fn u8(&mut self, v: u8) {
        self.out.push(v);
    }

    fn u16(&mut self, v: u16) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    fn u32(&mut self, v: u32) {
        self.out.extend_from_slice(&v.to_le_bytes());
    }

    fn bytes(&mut self, v: &[u8]) {
        self.out.extend_from_slice(v);
    }

    fn region(&mut self, region: RegionRef) {
        self.u32(region.offset);
        self.u32(region.len);
    }

    fn finish(mut self) -> Vec<u8> {
        debug_assert!(self.out.len() <= MAX_MESSAGE_BYTES);
        let payload_len = (self.out.len() - HEADER_BYTES) as u16;
        self.out[2..4].copy_from_slice(&payload_len.to_le_bytes());
        self.out
    }
}

pub(crate) struct Reader<'a> {
    bytes: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    pub(crate) fn new(bytes: &'a [u8]) -> Self {
        Self { bytes, pos: 0 }
    }

    pub(crate) fn remaining(&self) -> usize {
        self.bytes.len().saturating_sub(self.pos)
    }

    pub(crate) fn finish(&self) -> Result<(), DecodeError> {
        match self.remaining() {
            0 => Ok(()),
            n => Err(DecodeError::TrailingBytes(n)),
        }
    }

    pub(crate) fn read_u8(&mut self) -> Result<u8, DecodeError> {
        let b = *self.bytes.get(self.pos).ok_or(DecodeError::UnexpectedEof)?;
        self.pos += 1;
        Ok(b)
    }

    pub(crate) fn read_u16(&mut self) -> Result<u16, DecodeError> {
        let bytes = self.read_bytes(2)?;
        Ok(u16::from_le_bytes([bytes[0], bytes[1]]))
    }

    pub(crate) fn read_u32(&mut self) -> Result<u32, DecodeError> {
        let bytes = self.read_bytes(4)?;
        Ok(u32::from_le_bytes([bytes[0], bytes[1], bytes[2], bytes[3]]))
    }

    pub(crate) fn read_u64(&mut self) -> Result<u64, DecodeError> {
        let bytes = self.read_bytes(8)?;
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        Ok(u64::from_le_bytes(raw))
    }

    fn read_region(&mut self) -> Result<RegionRef, DecodeError> {
        Ok(RegionRef {
            offset: self.read_u32()?,
            len: self.read_u32()?,
        })
    }

    pub(crate) fn read_bytes(&mut self, len: usize) -> Result<&'a [u8], DecodeError> {
        if self.remaining() < len {
            return Err(DecodeError::UnexpectedEof);
        }
        let start = self.pos;
        self.pos += len;
        Ok(&self.bytes[start..start + len])
    }
}
