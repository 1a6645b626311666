use thiserror::Error;

use crate::buffer_pool::PoolError;
use crate::channel::LinkError;
use crate::state::ControllerState;
use crate::transfer::TransferRequest;

pub type Result<T> = std::result::Result<T, OffloadError>;

/// Caller-visible failures of the offload proxy.
///
/// `QueueFull` and `NoBuffer` are transient and safe to retry. `Timeout` is only ever returned
/// after the state machine has rolled back to [`ControllerState::Origin`].
#[derive(Debug, Error)]
pub enum OffloadError {
    #[error("controller is not eligible for offload")]
    NotEligible,

    #[error("another transition or synchronous call is in progress")]
    Busy,

    #[error("timed out waiting for the coprocessor or the standard driver")]
    Timeout,

    #[error("transfer not found")]
    NotFound,

    #[error("request queue is full")]
    QueueFull,

    #[error("no shared buffer available: {0}")]
    NoBuffer(#[from] PoolError),

    #[error("operation not valid in state {0:?}")]
    InvalidState(ControllerState),

    #[error("message link failed: {0}")]
    Link(#[from] LinkError),

    #[error("coprocessor rejected message {id:#06x} with code {code}")]
    Peer { id: u16, code: i32 },

    #[error("coprocessor recovery in progress")]
    Recovering,

    #[error("offload controller has shut down")]
    ShutDown,
}

/// A rejected submission. The transfer is handed back untouched so the caller can retry it; no
/// completion will be delivered for it.
#[derive(Debug, Error)]
#[error("transfer submission rejected: {error}")]
pub struct SubmitError {
    #[source]
    pub error: OffloadError,
    pub request: TransferRequest,
}

impl SubmitError {
    pub fn new(error: OffloadError, request: TransferRequest) -> Self {
        Self { error, request }
    }

    pub fn into_parts(self) -> (OffloadError, TransferRequest) {
        (self.error, self.request)
    }
}
