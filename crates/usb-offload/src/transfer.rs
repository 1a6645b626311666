//! Transfer requests and their one-shot completion.
//!
//! A [`TransferRequest`] owns the sending half of its completion channel, so delivering a
//! completion consumes the request. Whichever container holds the request (request queue,
//! tracking list, or the standard driver) is therefore the only party able to complete it.

use core::sync::atomic::{AtomicU32, Ordering};

use serde::{Deserialize, Serialize};
use tokio::sync::oneshot;

use usb_offload_ipc::EndpointKind;

/// Process-unique transfer identity; doubles as the wire tag.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct TransferId(u32);

impl TransferId {
    fn next() -> Self {
        static NEXT: AtomicU32 = AtomicU32::new(1);
        loop {
            let id = NEXT.fetch_add(1, Ordering::Relaxed);
            // 0 is reserved so a zeroed tag on the wire never matches a live transfer.
            if id != 0 {
                return Self(id);
            }
        }
    }

    pub fn from_tag(tag: u32) -> Self {
        Self(tag)
    }

    pub fn tag(self) -> u32 {
        self.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum TransferType {
    Control,
    Isochronous,
    Bulk,
    Interrupt,
}

impl From<TransferType> for EndpointKind {
    fn from(t: TransferType) -> Self {
        match t {
            TransferType::Control => EndpointKind::Control,
            TransferType::Isochronous => EndpointKind::Isochronous,
            TransferType::Bulk => EndpointKind::Bulk,
            TransferType::Interrupt => EndpointKind::Interrupt,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Direction {
    In,
    Out,
}

/// Endpoint identity: address (bit 7 = IN) plus transfer type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct Endpoint {
    pub address: u8,
    pub kind: TransferType,
}

impl Endpoint {
    pub const CONTROL: Endpoint = Endpoint {
        address: 0x00,
        kind: TransferType::Control,
    };

    pub fn new(address: u8, kind: TransferType) -> Self {
        Self { address, kind }
    }

    pub fn number(&self) -> u8 {
        self.address & 0x0f
    }

    pub fn direction(&self) -> Direction {
        if self.address & 0x80 != 0 {
            Direction::In
        } else {
            Direction::Out
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetupPacket {
    #[serde(rename = "bmRequestType")]
    pub bm_request_type: u8,
    #[serde(rename = "bRequest")]
    pub b_request: u8,
    #[serde(rename = "wValue")]
    pub w_value: u16,
    #[serde(rename = "wIndex")]
    pub w_index: u16,
    #[serde(rename = "wLength")]
    pub w_length: u16,
}

impl SetupPacket {
    pub fn is_device_to_host(self) -> bool {
        (self.bm_request_type & 0x80) != 0
    }

    pub fn to_bytes(self) -> [u8; 8] {
        let v = self.w_value.to_le_bytes();
        let i = self.w_index.to_le_bytes();
        let l = self.w_length.to_le_bytes();
        [
            self.bm_request_type,
            self.b_request,
            v[0],
            v[1],
            i[0],
            i[1],
            l[0],
            l[1],
        ]
    }
}

/// Final status of a transfer, as seen by the submitter.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum TransferStatus {
    Success,
    /// Completed with fewer bytes than requested.
    ShortTransfer,
    Cancelled,
    /// The coprocessor failed the transfer or died while holding it.
    PeerError,
    NoDevice,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferResult {
    pub id: TransferId,
    pub status: TransferStatus,
    pub actual_length: usize,
    /// IN data (truncated to `actual_length`); empty for OUT transfers.
    pub data: Vec<u8>,
}

/// One bus I/O operation awaiting execution.
#[derive(Debug)]
pub struct TransferRequest {
    id: TransferId,
    endpoint: Endpoint,
    setup: Option<SetupPacket>,
    length: usize,
    /// OUT data; empty for IN transfers.
    data: Vec<u8>,
    completer: oneshot::Sender<TransferResult>,
}

impl TransferRequest {
    /// IN transfer of up to `length` bytes on a non-control endpoint.
    pub fn new_in(endpoint: Endpoint, length: usize) -> (Self, TransferHandle) {
        debug_assert_eq!(endpoint.direction(), Direction::In);
        Self::build(endpoint, None, length, Vec::new())
    }

    /// OUT transfer of `data` on a non-control endpoint.
    pub fn new_out(endpoint: Endpoint, data: Vec<u8>) -> (Self, TransferHandle) {
        debug_assert_eq!(endpoint.direction(), Direction::Out);
        let length = data.len();
        Self::build(endpoint, None, length, data)
    }

    /// Control transfer on endpoint 0. `data` is the OUT data stage, if any.
    pub fn new_control(setup: SetupPacket, data: Vec<u8>) -> (Self, TransferHandle) {
        let address = if setup.is_device_to_host() { 0x80 } else { 0x00 };
        let endpoint = Endpoint::new(address, TransferType::Control);
        let length = usize::from(setup.w_length);
        let data = if setup.is_device_to_host() {
            Vec::new()
        } else {
            data
        };
        Self::build(endpoint, Some(setup), length, data)
    }

    fn build(
        endpoint: Endpoint,
        setup: Option<SetupPacket>,
        length: usize,
        data: Vec<u8>,
    ) -> (Self, TransferHandle) {
        let (tx, rx) = oneshot::channel();
        let id = TransferId::next();
        let req = Self {
            id,
            endpoint,
            setup,
            length,
            data,
            completer: tx,
        };
        (req, TransferHandle { id, rx })
    }

    pub fn id(&self) -> TransferId {
        self.id
    }

    pub fn endpoint(&self) -> Endpoint {
        self.endpoint
    }

    pub fn setup(&self) -> Option<SetupPacket> {
        self.setup
    }

    pub fn length(&self) -> usize {
        self.length
    }

    pub fn out_data(&self) -> &[u8] {
        &self.data
    }

    pub fn is_in(&self) -> bool {
        self.endpoint.direction() == Direction::In
    }

    /// Delivers the completion. Consuming `self` makes a second delivery impossible.
    pub fn complete(self, status: TransferStatus, actual_length: usize, mut data: Vec<u8>) {
        let actual_length = actual_length.min(self.length);
        data.truncate(actual_length);
        let result = TransferResult {
            id: self.id,
            status,
            actual_length,
            data,
        };
        if self.completer.send(result).is_err() {
            tracing::trace!(id = self.id.tag(), "completion receiver dropped");
        }
    }

    /// Completes without data; used by every cancellation path.
    pub fn complete_with(self, status: TransferStatus) {
        self.complete(status, 0, Vec::new());
    }
}

/// Caller-side half of a submitted transfer.
#[derive(Debug)]
pub struct TransferHandle {
    id: TransferId,
    rx: oneshot::Receiver<TransferResult>,
}

impl TransferHandle {
    pub fn id(&self) -> TransferId {
        self.id
    }

    /// Waits for the completion. Returns `None` if the request was dropped without completing,
    /// which only happens when a submission was rejected and the caller discarded the request.
    pub async fn wait(self) -> Option<TransferResult> {
        self.rx.await.ok()
    }

    /// Non-blocking poll for the completion.
    pub fn try_result(&mut self) -> Option<TransferResult> {
        self.rx.try_recv().ok()
    }
}
