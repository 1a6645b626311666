//! Controller ownership state.

use core::sync::atomic::{AtomicU8, Ordering};

use serde::Serialize;

/// Who currently executes transfers for the attached peripheral.
///
/// The only legal cycle is `Origin → SwitchingToOffload → Offloaded → SwitchingToOrigin →
/// Origin`, plus the rollbacks `SwitchingToOffload → Origin` (failed handoff) and
/// `* → Origin` (forced recovery).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
pub enum ControllerState {
    /// The standard driver owns the rings.
    Origin,
    SwitchingToOffload,
    /// The coprocessor owns the rings.
    Offloaded,
    SwitchingToOrigin,
}

impl ControllerState {
    fn to_u8(self) -> u8 {
        match self {
            ControllerState::Origin => 0,
            ControllerState::SwitchingToOffload => 1,
            ControllerState::Offloaded => 2,
            ControllerState::SwitchingToOrigin => 3,
        }
    }

    fn from_u8(v: u8) -> Self {
        match v {
            1 => ControllerState::SwitchingToOffload,
            2 => ControllerState::Offloaded,
            3 => ControllerState::SwitchingToOrigin,
            _ => ControllerState::Origin,
        }
    }

    pub fn is_switching(self) -> bool {
        matches!(
            self,
            ControllerState::SwitchingToOffload | ControllerState::SwitchingToOrigin
        )
    }

    /// Whether new submissions belong on the offload path.
    pub fn routes_to_offload(self) -> bool {
        !matches!(self, ControllerState::Origin)
    }

    /// Whether `self → next` is an edge of the switch cycle (forced recovery excluded).
    pub fn can_transition_to(self, next: ControllerState) -> bool {
        use ControllerState::*;
        matches!(
            (self, next),
            (Origin, SwitchingToOffload)
                | (SwitchingToOffload, Offloaded)
                | (SwitchingToOffload, Origin)
                | (Offloaded, SwitchingToOrigin)
                | (SwitchingToOrigin, Origin)
        )
    }
}

/// Lock-free readable state cell. Writers must hold the controller lock.
#[derive(Debug)]
pub struct StateCell(AtomicU8);

impl StateCell {
    pub fn new() -> Self {
        Self(AtomicU8::new(ControllerState::Origin.to_u8()))
    }

    pub fn load(&self) -> ControllerState {
        ControllerState::from_u8(self.0.load(Ordering::Acquire))
    }

    pub(crate) fn store(&self, next: ControllerState) {
        let prev = self.load();
        debug_assert!(
            prev == next || prev.can_transition_to(next) || next == ControllerState::Origin,
            "illegal controller transition {prev:?} -> {next:?}"
        );
        tracing::debug!(from = ?prev, to = ?next, "controller state");
        self.0.store(next.to_u8(), Ordering::Release);
    }
}

impl Default for StateCell {
    fn default() -> Self {
        Self::new()
    }
}
