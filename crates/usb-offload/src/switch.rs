//! Transitions between standard-driver and coprocessor ownership.
//!
//! All mutating operations hold the controller lock, except across the synchronous `START`/`STOP`
//! waits: the lock is dropped before the wait and retaken after, and the state is re-checked. A
//! transition that finds the state mid-switch fails with `Busy`.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{Mutex, MutexGuard};

use usb_offload_ipc::layout::to_coprocessor;
use usb_offload_ipc::{Command, RegionRef, RingSnapshot};

use crate::buffer_pool::BufferHandle;
use crate::controller::Peripheral;
use crate::error::{OffloadError, Result};
use crate::offload::OffloadController;
use crate::pm::{KeepActive, RuntimePm};
use crate::port::Capability;
use crate::state::ControllerState;
use crate::stats::Stats;
use crate::transfer::{Endpoint, TransferStatus};

#[derive(Debug, Clone, Copy)]
pub(crate) struct SwitchTimings {
    pub sync_timeout: Duration,
    pub quiesce_retries: u32,
    pub quiesce_interval: Duration,
}

/// State guarded by the controller lock.
#[derive(Debug, Default)]
pub(crate) struct Attached {
    peripheral: Option<Peripheral>,
    keep_active: Option<KeepActive>,
}

pub(crate) struct SwitchMachine {
    offload: Arc<OffloadController>,
    inner: Mutex<Attached>,
    pm: Arc<RuntimePm>,
    timings: SwitchTimings,
    offload_classes: Vec<u8>,
}

impl SwitchMachine {
    pub fn new(
        offload: Arc<OffloadController>,
        pm: Arc<RuntimePm>,
        timings: SwitchTimings,
        offload_classes: Vec<u8>,
    ) -> Self {
        Self {
            offload,
            inner: Mutex::new(Attached::default()),
            pm,
            timings,
            offload_classes,
        }
    }

    pub fn state(&self) -> ControllerState {
        self.offload.state()
    }

    pub fn is_offloadable(&self, peripheral: &Peripheral) -> bool {
        peripheral.is_offloadable(&self.offload_classes)
    }

    pub async fn switch_to_offload(&self) -> Result<()> {
        let inner = self.inner.lock().await;
        let state = self.state();
        if state.is_switching() {
            return Err(OffloadError::Busy);
        }
        if state != ControllerState::Origin || self.offload.recovering.load(Ordering::Acquire) {
            return Err(OffloadError::NotEligible);
        }
        let peripheral = inner
            .peripheral
            .clone()
            .filter(|p| self.is_offloadable(p))
            .ok_or(OffloadError::NotEligible)?;

        self.offload.set_state(ControllerState::SwitchingToOffload);
        tracing::info!(slot = peripheral.slot_id, "switching to offload");

        if let Err(err) = self.quiesce().await {
            self.roll_back(false);
            return Err(err);
        }

        let bundle = match self.stage_bundle(&peripheral) {
            Ok(bundle) => bundle,
            Err(err) => {
                tracing::warn!("descriptor handoff failed: {err}");
                self.roll_back(false);
                return Err(err);
            }
        };

        drop(inner);
        let acked = self
            .offload
            .channel
            .send_sync(
                &Command::Start {
                    bundle: bundle.region(),
                },
                self.timings.sync_timeout,
            )
            .await;
        let mut inner = self.inner.lock().await;
        self.offload.pool.release(bundle);

        let outcome = match acked {
            Ok(0) if self.offload.recovering.load(Ordering::Acquire) => {
                Err(OffloadError::Recovering)
            }
            Ok(0) if inner.peripheral.as_ref() != Some(&peripheral) => {
                Err(OffloadError::NotEligible)
            }
            Ok(0) => Ok(()),
            Ok(code) => Err(OffloadError::Peer {
                id: to_coprocessor::START,
                code,
            }),
            Err(err) => Err(err),
        };

        match outcome {
            Ok(()) => {
                self.offload.begin_session(peripheral.port);
                self.offload.set_state(ControllerState::Offloaded);
                inner.keep_active = Some(self.pm.keep_active());
                Stats::bump(&self.offload.stats.offload_entries);
                self.offload.queue.kick();
                tracing::info!(slot = peripheral.slot_id, "offloaded");
                Ok(())
            }
            Err(err) => {
                tracing::warn!("coprocessor did not take over: {err}");
                let stop = Command::Stop {
                    snapshot: RegionRef::NONE,
                };
                if let Err(send_err) = self.offload.channel.send_async(&stop) {
                    tracing::debug!("compensating stop not sent: {send_err}");
                }
                self.roll_back(true);
                Err(err)
            }
        }
    }

    pub async fn switch_to_origin(&self) -> Result<()> {
        self.switch_to_origin_with(TransferStatus::Cancelled).await
    }

    /// Returns the rings to the standard driver, completing leftover transfers with `status`.
    pub async fn switch_to_origin_with(&self, status: TransferStatus) -> Result<()> {
        if self.offload.recovering.load(Ordering::Acquire) {
            let mut inner = self.inner.lock().await;
            self.force_to_origin(&mut inner);
            return Ok(());
        }
        let inner = self.inner.lock().await;
        self.release_to_origin(inner, status).await
    }

    pub async fn attach(&self, peripheral: Peripheral) -> Capability {
        let mut inner = self.inner.lock().await;
        tracing::info!(
            slot = peripheral.slot_id,
            class = peripheral.interface_class,
            "peripheral attached"
        );
        inner.peripheral = Some(peripheral);
        self.capability_of(&inner)
    }

    /// Forgets the peripheral. If it was offloaded, the rings come back and every leftover
    /// transfer completes with `NoDevice`. A switch waiting on its ack notices the peripheral is
    /// gone: one to offload rolls back, one to origin flushes with `NoDevice`.
    pub async fn disconnect(&self) -> Result<()> {
        let mut inner = self.inner.lock().await;
        if let Some(p) = inner.peripheral.take() {
            tracing::info!(slot = p.slot_id, "peripheral disconnected");
        }
        if self.offload.recovering.load(Ordering::Acquire) {
            self.force_to_origin(&mut inner);
            return Ok(());
        }
        if self.state() == ControllerState::Offloaded {
            return self.release_to_origin(inner, TransferStatus::NoDevice).await;
        }
        Ok(())
    }

    pub async fn capability(&self) -> Capability {
        let inner = self.inner.lock().await;
        self.capability_of(&inner)
    }

    fn capability_of(&self, inner: &Attached) -> Capability {
        match &inner.peripheral {
            None => Capability::NotAttached,
            Some(_) if self.state() == ControllerState::Offloaded => Capability::AttachedOffloaded,
            Some(_) => Capability::AttachedNotOffloadable,
        }
    }

    async fn release_to_origin(
        &self,
        inner: MutexGuard<'_, Attached>,
        status: TransferStatus,
    ) -> Result<()> {
        match self.state() {
            ControllerState::Offloaded => {}
            state if state.is_switching() => return Err(OffloadError::Busy),
            state => return Err(OffloadError::InvalidState(state)),
        }

        self.offload.set_state(ControllerState::SwitchingToOrigin);
        tracing::info!("switching to origin");

        let endpoints = inner
            .peripheral
            .as_ref()
            .map_or(0, |p| p.endpoints.len())
            + 1;
        let snapshot_buf = match self
            .offload
            .pool
            .acquire(RingSnapshot::max_encoded_len(endpoints))
        {
            Ok(buf) => Some(buf),
            Err(err) => {
                tracing::warn!("no room for ring snapshot, rings will be reset: {err}");
                None
            }
        };
        let region = snapshot_buf
            .as_ref()
            .map_or(RegionRef::NONE, BufferHandle::region);

        drop(inner);
        let acked = self
            .offload
            .channel
            .send_sync(&Command::Stop { snapshot: region }, self.timings.sync_timeout)
            .await;
        let mut inner = self.inner.lock().await;
        // Disconnected while the stop was outstanding.
        let status = if inner.peripheral.is_none() {
            TransferStatus::NoDevice
        } else {
            status
        };

        let code = match acked {
            Ok(code) if !self.offload.recovering.load(Ordering::Acquire) => code,
            other => {
                match other {
                    Err(err) => tracing::warn!("stop handshake failed, forcing reset: {err}"),
                    Ok(_) => tracing::warn!("recovery started during stop, forcing reset"),
                }
                if let Some(buf) = snapshot_buf {
                    self.offload.pool.release(buf);
                }
                self.force_to_origin(&mut inner);
                return Ok(());
            }
        };
        if code != 0 {
            tracing::warn!(code, "coprocessor reported an error on stop");
        }

        let snapshot = snapshot_buf.and_then(|buf| self.take_snapshot(buf));
        self.offload.standard.resume_ownership(snapshot.as_ref());

        self.offload.flush(status);
        self.offload.set_state(ControllerState::Origin);
        self.offload.end_session();
        inner.keep_active = None;
        Stats::bump(&self.offload.stats.offload_exits);
        self.offload.queue.kick();
        tracing::info!(restored = snapshot.is_some(), "back on origin");
        Ok(())
    }

    /// Pre-recovery hook: silences the standard driver and marks the peer as failed. Any pending
    /// synchronous wait returns immediately.
    pub fn pre_recovery(&self) {
        tracing::warn!(state = ?self.state(), "coprocessor failure reported");
        self.offload.standard.disable_irq();
        self.offload.standard.abort_command_pipeline();
        self.offload.recovering.store(true, Ordering::Release);
        self.offload.channel.abort_waiters();
    }

    /// Unconditional return to `Origin` without talking to the coprocessor.
    fn force_to_origin(&self, inner: &mut Attached) {
        let prev = self.state();
        self.offload.set_state(ControllerState::Origin);
        self.offload.flush(TransferStatus::PeerError);
        self.offload.standard.resume_ownership(None);
        self.offload.end_session();
        inner.keep_active = None;
        self.offload.recovering.store(false, Ordering::Release);
        Stats::bump(&self.offload.stats.forced_recoveries);
        self.offload.queue.kick();
        tracing::warn!(from = ?prev, "forced back to origin");
    }

    fn roll_back(&self, handed_over: bool) {
        if handed_over {
            self.offload.standard.resume_ownership(None);
        }
        self.offload.set_state(ControllerState::Origin);
        Stats::bump(&self.offload.stats.offload_failures);
        self.offload.queue.kick();
        tracing::info!("switch to offload rolled back");
    }

    async fn quiesce(&self) -> Result<()> {
        let standard = &self.offload.standard;
        for attempt in 0..self.timings.quiesce_retries {
            let pending = standard.pending_ops();
            if pending == 0 && standard.ring_idle(Endpoint::CONTROL.address) {
                tracing::debug!(attempt, "standard driver quiesced");
                return Ok(());
            }
            tracing::trace!(attempt, pending, "waiting for standard driver to quiesce");
            tokio::time::sleep(self.timings.quiesce_interval).await;
        }
        tracing::warn!(
            retries = self.timings.quiesce_retries,
            "standard driver did not quiesce"
        );
        Err(OffloadError::Timeout)
    }

    fn take_snapshot(&self, buf: BufferHandle) -> Option<RingSnapshot> {
        let bytes = self.offload.pool.read(&buf, buf.capacity());
        self.offload.pool.release(buf);
        let decoded = match bytes {
            Ok(bytes) => RingSnapshot::decode(&bytes),
            Err(err) => {
                tracing::warn!("reading ring snapshot failed: {err}");
                return None;
            }
        };
        match decoded {
            Ok(snapshot) => Some(snapshot),
            Err(err) => {
                tracing::warn!("bad ring snapshot: {err}");
                None
            }
        }
    }

    fn stage_bundle(&self, peripheral: &Peripheral) -> Result<BufferHandle> {
        let bundle = self.offload.standard.gather_descriptors(peripheral)?;
        let encoded = bundle.encode();
        let buf = self.offload.pool.acquire(encoded.len())?;
        if let Err(err) = self.offload.pool.write(&buf, &encoded) {
            self.offload.pool.release(buf);
            return Err(err.into());
        }
        Ok(buf)
    }
}
