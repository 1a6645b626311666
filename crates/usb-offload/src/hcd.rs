//! The host-controller facade.
//!
//! [`OffloadHcd`] exposes the same operation set as the standard driver and routes every call to
//! the standard driver while the controller is in `Origin`, and to the offload path otherwise.
//! It owns the worker and dispatcher tasks for its whole lifetime.

use std::sync::Arc;

use tokio::task::JoinHandle;

use usb_offload_ipc::Command;

use crate::buffer_pool::{SharedBufferPool, SharedRegion};
use crate::channel::{EventHandler, Link, MessageChannel};
use crate::config::{ConfigError, OffloadConfig};
use crate::controller::{HostControllerOps, Peripheral, StandardController};
use crate::error::{OffloadError, Result, SubmitError};
use crate::offload::OffloadController;
use crate::pm::RuntimePm;
use crate::policy::ControlPolicy;
use crate::port::{Capability, PortStatus};
use crate::queue::RequestQueue;
use crate::state::ControllerState;
use crate::stats::{Stats, StatsSnapshot};
use crate::switch::{SwitchMachine, SwitchTimings};
use crate::transfer::{TransferId, TransferRequest, TransferStatus};

pub struct OffloadHcd {
    config: OffloadConfig,
    standard: Arc<dyn StandardController>,
    offload: Arc<OffloadController>,
    switch: SwitchMachine,
    channel: Arc<MessageChannel>,
    pm: Arc<RuntimePm>,
    stats: Arc<Stats>,
    tasks: Vec<JoinHandle<()>>,
}

impl OffloadHcd {
    /// Builds the proxy around `standard` and spawns its worker and dispatcher tasks.
    ///
    /// Must be called from within a Tokio runtime.
    pub fn new(
        config: OffloadConfig,
        standard: Arc<dyn StandardController>,
        link: Arc<dyn Link>,
    ) -> std::result::Result<Self, ConfigError> {
        config.validate()?;

        let stats = Arc::new(Stats::new());
        let channel = Arc::new(MessageChannel::new(
            link,
            config.receive_fifo_frames,
            stats.clone(),
        ));
        let pool = SharedBufferPool::new(config.region_base, config.slot_size, config.slot_count);
        let offload = Arc::new(OffloadController::new(
            pool,
            RequestQueue::new(config.queue_capacity),
            channel.clone(),
            standard.clone(),
            ControlPolicy::new(config.control_quirks.clone()),
            stats.clone(),
        ));
        let pm = RuntimePm::new();
        let switch = SwitchMachine::new(
            offload.clone(),
            pm.clone(),
            SwitchTimings {
                sync_timeout: config.sync_timeout(),
                quiesce_retries: config.quiesce_retries,
                quiesce_interval: config.quiesce_interval(),
            },
            config.offload_classes.clone(),
        );

        let worker = tokio::spawn(offload.clone().run_worker());
        let handler: Arc<dyn EventHandler> = offload.clone();
        let dispatcher = tokio::spawn(channel.clone().run_dispatcher(handler));

        tracing::debug!(
            slots = config.slot_count,
            slot_size = config.slot_size,
            queue = config.queue_capacity,
            "offload hcd created"
        );

        Ok(Self {
            config,
            standard,
            offload,
            switch,
            channel,
            pm,
            stats,
            tasks: vec![worker, dispatcher],
        })
    }

    pub fn config(&self) -> &OffloadConfig {
        &self.config
    }

    /// Starts the standard driver and records the attached peripheral.
    pub async fn start(&self, peripheral: Peripheral) -> Result<Capability> {
        self.standard.start()?;
        Ok(self.switch.attach(peripheral).await)
    }

    /// Returns to `Origin` if needed, then stops the standard driver.
    pub async fn stop(&self) -> Result<()> {
        self.switch.disconnect().await?;
        self.standard.stop();
        Ok(())
    }

    pub async fn attach(&self, peripheral: Peripheral) -> Capability {
        self.switch.attach(peripheral).await
    }

    pub async fn disconnect(&self) -> Result<()> {
        self.switch.disconnect().await
    }

    pub async fn switch_to_offload(&self) -> Result<()> {
        self.switch.switch_to_offload().await
    }

    pub async fn switch_to_origin(&self) -> Result<()> {
        self.switch.switch_to_origin().await
    }

    /// Lock-free.
    pub fn current_state(&self) -> ControllerState {
        self.offload.state()
    }

    pub async fn capability(&self) -> Capability {
        self.switch.capability().await
    }

    /// `GET_STATUS` round-trip; returns the coprocessor's status word.
    pub async fn coprocessor_status(&self) -> Result<i32> {
        self.channel
            .send_sync(&Command::GetStatus, self.config.sync_timeout())
            .await
    }

    /// Debug ping; the matching pong shows up in [`OffloadHcd::stats`].
    pub fn ping(&self, seq: u32) -> Result<()> {
        self.channel.send_async(&Command::Ping { seq })?;
        Ok(())
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.stats.snapshot()
    }

    pub fn is_idle_suspendable(&self) -> bool {
        self.pm.is_idle_suspendable()
    }

    /// Called by the owner of the coprocessor when it stops responding. Follow with
    /// [`OffloadHcd::switch_to_origin`].
    pub fn pre_recovery(&self) {
        self.switch.pre_recovery();
    }

    /// Low-level receive callback for frames from the coprocessor.
    pub fn receive(&self, frame: &[u8]) {
        self.channel.receive(frame);
    }

    pub fn channel(&self) -> &Arc<MessageChannel> {
        &self.channel
    }

    pub fn shared_region(&self) -> &Arc<SharedRegion> {
        self.offload.pool().region()
    }

    pub fn used_slots(&self) -> usize {
        self.offload.pool().used_slots()
    }

    /// Stops the background tasks. Transfers still owned by the offload path complete with
    /// `NoDevice`.
    pub async fn shutdown(mut self) {
        for task in std::mem::take(&mut self.tasks) {
            task.abort();
            let _ = task.await;
        }
        self.channel.abort_waiters();
        self.offload.flush(TransferStatus::NoDevice);
        tracing::debug!("offload hcd shut down");
    }
}

impl HostControllerOps for OffloadHcd {
    fn submit(&self, request: TransferRequest) -> std::result::Result<(), SubmitError> {
        if self.current_state().routes_to_offload() {
            self.offload.submit(request)
        } else {
            self.standard.submit(request)
        }
    }

    /// The offload path is consulted in every state: transfers it still holds after a switch
    /// back are cancelled there, everything else falls through to the standard driver.
    fn dequeue(&self, id: TransferId, status: TransferStatus) -> Result<()> {
        self.offload.dequeue(id, status)
    }

    fn port_status(&self, port: u8) -> PortStatus {
        match self.current_state() {
            ControllerState::Offloaded | ControllerState::SwitchingToOrigin => {
                self.offload.port_status(port)
            }
            _ => self.standard.port_status(port),
        }
    }

    fn bus_suspend(&self) -> Result<()> {
        match self.current_state() {
            ControllerState::Origin => self.standard.bus_suspend(),
            ControllerState::Offloaded => self.offload.bus_suspend(),
            state => Err(OffloadError::InvalidState(state)),
        }
    }

    fn bus_resume(&self) -> Result<()> {
        match self.current_state() {
            ControllerState::Origin => self.standard.bus_resume(),
            ControllerState::Offloaded => self.offload.bus_resume(),
            state => Err(OffloadError::InvalidState(state)),
        }
    }
}

impl Drop for OffloadHcd {
    fn drop(&mut self) {
        for task in self.tasks.drain(..) {
            task.abort();
        }
    }
}

impl std::fmt::Debug for OffloadHcd {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OffloadHcd")
            .field("offload", &self.offload)
            .field("idle_suspendable", &self.is_idle_suspendable())
            .finish_non_exhaustive()
    }
}
