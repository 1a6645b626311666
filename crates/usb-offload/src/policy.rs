//! Control requests answered on the host without reaching the coprocessor.
//!
//! Some peripherals misbehave when certain standard or class requests are forwarded while the
//! controller is offloaded (remote-wakeup feature toggles, interface class requests issued during
//! bus suspend). The quirk table is configuration; the worker consults it before every submit.

use serde::{Deserialize, Serialize};

use crate::transfer::SetupPacket;

const REQ_CLEAR_FEATURE: u8 = 0x01;
const REQ_SET_FEATURE: u8 = 0x03;
const FEATURE_DEVICE_REMOTE_WAKEUP: u16 = 0x0001;

/// Host-to-device, class, interface.
const REQUEST_TYPE_CLASS_INTERFACE_OUT: u8 = 0x21;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ControlQuirk {
    pub request_type: u8,
    /// `None` matches every `bRequest`.
    #[serde(default)]
    pub request: Option<u8>,
    /// `None` matches every `wValue`.
    #[serde(default)]
    pub value: Option<u16>,
    /// Only applies while the bus is suspended.
    #[serde(default)]
    pub only_while_suspended: bool,
}

impl ControlQuirk {
    pub fn matches(&self, setup: &SetupPacket, bus_suspended: bool) -> bool {
        if self.only_while_suspended && !bus_suspended {
            return false;
        }
        setup.bm_request_type == self.request_type
            && self.request.map_or(true, |r| r == setup.b_request)
            && self.value.map_or(true, |v| v == setup.w_value)
    }
}

pub fn default_quirks() -> Vec<ControlQuirk> {
    vec![
        ControlQuirk {
            request_type: 0x00,
            request: Some(REQ_SET_FEATURE),
            value: Some(FEATURE_DEVICE_REMOTE_WAKEUP),
            only_while_suspended: false,
        },
        ControlQuirk {
            request_type: 0x00,
            request: Some(REQ_CLEAR_FEATURE),
            value: Some(FEATURE_DEVICE_REMOTE_WAKEUP),
            only_while_suspended: false,
        },
        ControlQuirk {
            request_type: REQUEST_TYPE_CLASS_INTERFACE_OUT,
            request: None,
            value: None,
            only_while_suspended: true,
        },
    ]
}

#[derive(Debug, Clone, Default)]
pub struct ControlPolicy {
    quirks: Vec<ControlQuirk>,
}

impl ControlPolicy {
    pub fn new(quirks: Vec<ControlQuirk>) -> Self {
        Self { quirks }
    }

    /// Whether `setup` should be completed locally with success.
    pub fn answers_locally(&self, setup: &SetupPacket, bus_suspended: bool) -> bool {
        self.quirks.iter().any(|q| q.matches(setup, bus_suspended))
    }
}
