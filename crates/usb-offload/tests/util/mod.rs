#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::task::JoinHandle;

use usb_offload::ipc::{
    decode_command, encode_event, Command, DescriptorBundle, Event, RingCursor, RingSnapshot,
    WireStatus,
};
use usb_offload::{
    Endpoint, HostControllerOps, MailboxLink, MessageChannel, OffloadConfig, OffloadError,
    OffloadHcd, Peripheral, PortStatus, Result, SharedRegion, StandardController, SubmitError,
    TransferId, TransferRequest, TransferStatus, TransferType, CLASS_AUDIO,
};

pub const AUDIO_IN: u8 = 0x81;
pub const AUDIO_OUT: u8 = 0x02;

pub const COPROCESSOR_STATUS: i32 = 7;

pub fn audio_peripheral() -> Peripheral {
    Peripheral {
        slot_id: 1,
        address: 5,
        port: 1,
        speed: 3,
        interface_class: CLASS_AUDIO,
        endpoints: vec![
            Endpoint::new(AUDIO_IN, TransferType::Interrupt),
            Endpoint::new(AUDIO_OUT, TransferType::Isochronous),
        ],
    }
}

pub fn test_config() -> OffloadConfig {
    OffloadConfig {
        slot_size: 64,
        slot_count: 16,
        queue_capacity: 8,
        sync_timeout_ms: 500,
        quiesce_retries: 4,
        quiesce_interval_ms: 10,
        ..OffloadConfig::default()
    }
}

#[derive(Default)]
struct StandardState {
    started: bool,
    pending_ops: usize,
    owned: Vec<TransferRequest>,
    linked: HashMap<TransferId, Endpoint>,
    resumed: Vec<Option<RingSnapshot>>,
    irq_disabled: bool,
    pipeline_aborted: bool,
    suspended: bool,
}

/// Stand-in for the wrapped host-controller driver.
#[derive(Default)]
pub struct FakeStandard {
    state: Mutex<StandardState>,
}

impl FakeStandard {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, StandardState> {
        self.state.lock().unwrap()
    }

    pub fn set_pending_ops(&self, n: usize) {
        self.lock().pending_ops = n;
    }

    pub fn owned_len(&self) -> usize {
        self.lock().owned.len()
    }

    pub fn complete_owned(&self, status: TransferStatus) {
        let owned = std::mem::take(&mut self.lock().owned);
        for req in owned {
            req.complete_with(status);
        }
    }

    pub fn linked_len(&self) -> usize {
        self.lock().linked.len()
    }

    pub fn resumed(&self) -> Vec<Option<RingSnapshot>> {
        self.lock().resumed.clone()
    }

    pub fn irq_disabled(&self) -> bool {
        self.lock().irq_disabled
    }

    pub fn pipeline_aborted(&self) -> bool {
        self.lock().pipeline_aborted
    }

    pub fn is_started(&self) -> bool {
        self.lock().started
    }

    pub fn is_suspended(&self) -> bool {
        self.lock().suspended
    }
}

impl HostControllerOps for FakeStandard {
    fn submit(&self, request: TransferRequest) -> std::result::Result<(), SubmitError> {
        self.lock().owned.push(request);
        Ok(())
    }

    fn dequeue(&self, id: TransferId, status: TransferStatus) -> Result<()> {
        let mut st = self.lock();
        let pos = st
            .owned
            .iter()
            .position(|r| r.id() == id)
            .ok_or(OffloadError::NotFound)?;
        let req = st.owned.remove(pos);
        drop(st);
        req.complete_with(status);
        Ok(())
    }

    fn port_status(&self, _port: u8) -> PortStatus {
        PortStatus::CONNECTION | PortStatus::ENABLE | PortStatus::POWER
    }

    fn bus_suspend(&self) -> Result<()> {
        self.lock().suspended = true;
        Ok(())
    }

    fn bus_resume(&self) -> Result<()> {
        self.lock().suspended = false;
        Ok(())
    }
}

impl StandardController for FakeStandard {
    fn start(&self) -> Result<()> {
        self.lock().started = true;
        Ok(())
    }

    fn stop(&self) {
        self.lock().started = false;
    }

    fn pending_ops(&self) -> usize {
        self.lock().pending_ops
    }

    fn ring_idle(&self, _endpoint: u8) -> bool {
        true
    }

    fn gather_descriptors(&self, peripheral: &Peripheral) -> Result<DescriptorBundle> {
        let mut rings = vec![RingCursor {
            endpoint: 0,
            dequeue: 0x9000_0000,
            cycle: true,
        }];
        rings.extend(peripheral.endpoints.iter().enumerate().map(|(i, ep)| RingCursor {
            endpoint: ep.address,
            dequeue: 0x9000_1000 + 0x1000 * i as u64,
            cycle: true,
        }));
        Ok(DescriptorBundle {
            slot_id: peripheral.slot_id,
            speed: peripheral.speed,
            dcbaa: 0x8000_0000,
            device_context: 0x8000_1000,
            event_ring: 0x8000_2000,
            rings,
        })
    }

    fn resume_ownership(&self, snapshot: Option<&RingSnapshot>) {
        self.lock().resumed.push(snapshot.cloned());
    }

    fn link_transfer(&self, id: TransferId, endpoint: Endpoint) {
        self.lock().linked.insert(id, endpoint);
    }

    fn unlink_transfer(&self, id: TransferId) {
        self.lock().linked.remove(&id);
    }

    fn is_linked(&self, id: TransferId) -> bool {
        self.lock().linked.contains_key(&id)
    }

    fn disable_irq(&self) {
        self.lock().irq_disabled = true;
    }

    fn abort_command_pipeline(&self) {
        self.lock().pipeline_aborted = true;
    }
}

/// How the fake coprocessor reacts to commands.
#[derive(Debug, Clone)]
pub struct Behavior {
    /// Result code for `START`; `None` never acks.
    pub ack_start: Option<i32>,
    /// Result code for `STOP`; `None` never acks.
    pub ack_stop: Option<i32>,
    /// Complete every `SUBMIT` right away (IN transfers get `in_actual` bytes).
    pub auto_complete: bool,
    /// Bytes returned for IN transfers; `None` fills the whole request.
    pub in_actual: Option<u32>,
    /// Answer every `DEQUEUE` with a cancelled completion for the same tag.
    pub echo_dequeue: bool,
}

impl Default for Behavior {
    fn default() -> Self {
        Self {
            ack_start: Some(0),
            ack_stop: Some(0),
            auto_complete: true,
            in_actual: None,
            echo_dequeue: true,
        }
    }
}

impl Behavior {
    pub fn unresponsive() -> Self {
        Self {
            ack_start: None,
            ack_stop: None,
            auto_complete: false,
            in_actual: None,
            echo_dequeue: false,
        }
    }
}

/// Scripted coprocessor reading the outbound mailbox and answering through the channel's
/// receive callback.
pub struct FakeCoprocessor {
    behavior: Arc<Mutex<Behavior>>,
    log: Arc<Mutex<Vec<Command>>>,
    bundles: Arc<Mutex<Vec<DescriptorBundle>>>,
    channel: Arc<MessageChannel>,
    region: Arc<SharedRegion>,
    task: JoinHandle<()>,
}

impl FakeCoprocessor {
    pub fn spawn(
        link: MailboxLink,
        channel: Arc<MessageChannel>,
        region: Arc<SharedRegion>,
    ) -> Self {
        let behavior = Arc::new(Mutex::new(Behavior::default()));
        let log = Arc::new(Mutex::new(Vec::new()));
        let bundles = Arc::new(Mutex::new(Vec::new()));

        let task = tokio::spawn({
            let behavior = behavior.clone();
            let log = log.clone();
            let bundles = bundles.clone();
            let channel = channel.clone();
            let region = region.clone();
            async move {
                loop {
                    link.doorbell().notified().await;
                    while let Ok(frame) = link.mailbox().try_pop() {
                        let cmd = decode_command(frame.as_bytes()).expect("host sent a bad frame");
                        log.lock().unwrap().push(cmd.clone());
                        let behavior = behavior.lock().unwrap().clone();
                        for reply in respond(&cmd, &behavior, &region, &bundles) {
                            channel.receive(&encode_event(&reply));
                        }
                    }
                }
            }
        });

        Self {
            behavior,
            log,
            bundles,
            channel,
            region,
            task,
        }
    }

    pub fn set_behavior(&self, behavior: Behavior) {
        *self.behavior.lock().unwrap() = behavior;
    }

    pub fn update(&self, f: impl FnOnce(&mut Behavior)) {
        f(&mut self.behavior.lock().unwrap());
    }

    pub fn log(&self) -> Vec<Command> {
        self.log.lock().unwrap().clone()
    }

    pub fn submitted_tags(&self) -> Vec<u32> {
        self.log()
            .into_iter()
            .filter_map(|c| match c {
                Command::Submit(s) => Some(s.tag),
                _ => None,
            })
            .collect()
    }

    pub fn dequeued_tags(&self) -> Vec<u32> {
        self.log()
            .into_iter()
            .filter_map(|c| match c {
                Command::Dequeue { tag, .. } => Some(tag),
                _ => None,
            })
            .collect()
    }

    pub fn count(&self, pred: impl Fn(&Command) -> bool) -> usize {
        self.log().iter().filter(|c| pred(c)).count()
    }

    pub fn bundles(&self) -> Vec<DescriptorBundle> {
        self.bundles.lock().unwrap().clone()
    }

    /// Injects an event as if the coprocessor had sent it.
    pub fn send(&self, event: Event) {
        self.channel.receive(&encode_event(&event));
    }

    pub fn region(&self) -> &Arc<SharedRegion> {
        &self.region
    }
}

impl Drop for FakeCoprocessor {
    fn drop(&mut self) {
        self.task.abort();
    }
}

fn respond(
    cmd: &Command,
    behavior: &Behavior,
    region: &SharedRegion,
    bundles: &Mutex<Vec<DescriptorBundle>>,
) -> Vec<Event> {
    let ack = |result: i32| Event::Ack {
        id: cmd.id(),
        result,
    };
    match cmd {
        Command::Start { bundle } => {
            let mut raw = vec![0u8; bundle.len as usize];
            region
                .read(bundle.offset as usize, &mut raw)
                .expect("bundle region in bounds");
            bundles
                .lock()
                .unwrap()
                .push(DescriptorBundle::decode(&raw).expect("valid bundle"));
            behavior.ack_start.map(ack).into_iter().collect()
        }
        Command::Stop { snapshot } => {
            let Some(code) = behavior.ack_stop else {
                return Vec::new();
            };
            if !snapshot.is_none() {
                let rings = bundles
                    .lock()
                    .unwrap()
                    .last()
                    .map(|b| b.rings.clone())
                    .unwrap_or_default()
                    .into_iter()
                    .map(|mut r| {
                        r.dequeue += 0x40;
                        r
                    })
                    .collect();
                let bytes = RingSnapshot { rings }.encode();
                region
                    .write(snapshot.offset as usize, &bytes)
                    .expect("snapshot region in bounds");
            }
            vec![ack(code)]
        }
        Command::GetStatus => vec![ack(COPROCESSOR_STATUS)],
        Command::Submit(req) if behavior.auto_complete => {
            let is_in = req.endpoint & 0x80 != 0;
            let actual = if is_in {
                behavior.in_actual.unwrap_or(req.length).min(req.length)
            } else {
                req.length
            };
            if is_in {
                let data: Vec<u8> = (0..actual).map(|i| (i as u8) ^ 0x5a).collect();
                region
                    .write(req.region.offset as usize, &data)
                    .expect("IN region in bounds");
            }
            vec![Event::TransferDone {
                tag: req.tag,
                status: WireStatus::Success,
                actual,
            }]
        }
        Command::Dequeue { tag, .. } if behavior.echo_dequeue => vec![Event::TransferDone {
            tag: *tag,
            status: WireStatus::Cancelled,
            actual: 0,
        }],
        Command::Ping { seq } => vec![Event::Pong { seq: *seq }],
        _ => Vec::new(),
    }
}

/// Expected IN payload produced by the fake coprocessor.
pub fn in_pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i as u8) ^ 0x5a).collect()
}

pub struct Harness {
    pub hcd: OffloadHcd,
    pub standard: Arc<FakeStandard>,
    pub coprocessor: FakeCoprocessor,
}

/// Routes `tracing` output through the test harness.
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_test_writer()
        .with_max_level(tracing::Level::DEBUG)
        .try_init();
}

impl Harness {
    pub fn new(config: OffloadConfig) -> Self {
        init_tracing();
        let standard = FakeStandard::new();
        let link = MailboxLink::new(64);
        let hcd = OffloadHcd::new(config, standard.clone(), Arc::new(link.clone()))
            .expect("valid config");
        let coprocessor =
            FakeCoprocessor::spawn(link, hcd.channel().clone(), hcd.shared_region().clone());
        Self {
            hcd,
            standard,
            coprocessor,
        }
    }

    /// Harness with an audio peripheral attached and the controller offloaded.
    pub async fn offloaded(config: OffloadConfig) -> Self {
        let h = Self::new(config);
        h.hcd.start(audio_peripheral()).await.expect("start");
        h.hcd.switch_to_offload().await.expect("switch to offload");
        h
    }
}

/// Lets spawned tasks (worker, dispatcher, fake coprocessor) run until they go idle.
pub async fn settle() {
    for _ in 0..16 {
        tokio::task::yield_now().await;
    }
}

pub fn interrupt_in(len: usize) -> (TransferRequest, usb_offload::TransferHandle) {
    TransferRequest::new_in(Endpoint::new(AUDIO_IN, TransferType::Interrupt), len)
}

pub fn iso_out(data: Vec<u8>) -> (TransferRequest, usb_offload::TransferHandle) {
    TransferRequest::new_out(Endpoint::new(AUDIO_OUT, TransferType::Isochronous), data)
}
