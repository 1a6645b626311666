mod util;

use std::time::Duration;

use tokio::time::Instant;

use usb_offload::{ControllerState, HostControllerOps, OffloadError, TransferStatus};

use util::{interrupt_in, iso_out, test_config, Behavior, Harness};

#[tokio::test(start_paused = true)]
async fn recovery_returns_to_origin_without_waiting_on_a_dead_peer() {
    let h = Harness::offloaded(test_config()).await;
    h.coprocessor.set_behavior(Behavior::unresponsive());

    let (a, ha) = interrupt_in(16);
    let (b, hb) = iso_out(vec![1; 70]);
    h.hcd.submit(a).unwrap();
    h.hcd.submit(b).unwrap();
    util::settle().await;
    assert_eq!(h.coprocessor.submitted_tags().len(), 2);
    assert_eq!(h.hcd.used_slots(), 3);

    let started = Instant::now();
    h.hcd.pre_recovery();
    assert!(h.standard.irq_disabled());
    assert!(h.standard.pipeline_aborted());
    h.hcd.switch_to_origin().await.unwrap();
    assert!(started.elapsed() < Duration::from_millis(500));

    assert_eq!(ha.wait().await.unwrap().status, TransferStatus::PeerError);
    assert_eq!(hb.wait().await.unwrap().status, TransferStatus::PeerError);
    assert_eq!(h.hcd.current_state(), ControllerState::Origin);
    assert_eq!(h.standard.resumed(), vec![None]);
    assert_eq!(h.hcd.used_slots(), 0);
    assert_eq!(h.standard.linked_len(), 0);
    assert!(h.hcd.is_idle_suspendable());

    let stats = h.hcd.stats();
    assert_eq!(stats.forced_recoveries, 1);
    assert_eq!(stats.peer_errors, 2);
    assert_eq!(stats.sync_timeouts, 0);

    // The coprocessor came back; offload works again.
    h.coprocessor.set_behavior(Behavior::default());
    h.hcd.switch_to_offload().await.unwrap();
    let (req, handle) = interrupt_in(4);
    h.hcd.submit(req).unwrap();
    assert_eq!(handle.wait().await.unwrap().status, TransferStatus::Success);
}

#[tokio::test(start_paused = true)]
async fn stop_timeout_forces_origin() {
    let h = Harness::offloaded(test_config()).await;
    h.coprocessor.set_behavior(Behavior::unresponsive());

    let (req, handle) = interrupt_in(16);
    h.hcd.submit(req).unwrap();
    util::settle().await;

    let started = Instant::now();
    h.hcd.switch_to_origin().await.unwrap();
    assert!(started.elapsed() >= Duration::from_millis(500));

    assert_eq!(handle.wait().await.unwrap().status, TransferStatus::PeerError);
    assert_eq!(h.hcd.current_state(), ControllerState::Origin);
    assert_eq!(h.hcd.used_slots(), 0);
    assert_eq!(h.standard.resumed(), vec![None]);

    let stats = h.hcd.stats();
    assert_eq!(stats.sync_timeouts, 1);
    assert_eq!(stats.forced_recoveries, 1);
    assert_eq!(stats.offload_exits, 0);
}

#[tokio::test(start_paused = true)]
async fn recovery_during_start_wait_aborts_the_switch() {
    let h = Harness::new(test_config());
    h.hcd.start(util::audio_peripheral()).await.unwrap();
    h.coprocessor.update(|b| b.ack_start = None);

    let started = Instant::now();
    let (switched, handle) = tokio::join!(h.hcd.switch_to_offload(), async {
        util::settle().await;
        let (req, handle) = interrupt_in(4);
        h.hcd.submit(req).unwrap();
        h.hcd.pre_recovery();
        handle
    });
    assert!(matches!(switched, Err(OffloadError::Recovering)), "{switched:?}");
    assert!(started.elapsed() < Duration::from_millis(500));
    assert_eq!(h.hcd.current_state(), ControllerState::Origin);
    assert_eq!(handle.wait().await.unwrap().status, TransferStatus::PeerError);

    // Offload stays refused until recovery has been completed.
    assert!(matches!(
        h.hcd.switch_to_offload().await,
        Err(OffloadError::NotEligible)
    ));
    h.hcd.switch_to_origin().await.unwrap();
    assert_eq!(h.hcd.stats().forced_recoveries, 1);

    h.coprocessor.update(|b| b.ack_start = Some(0));
    h.hcd.switch_to_offload().await.unwrap();
    assert_eq!(h.hcd.current_state(), ControllerState::Offloaded);
}

#[tokio::test(start_paused = true)]
async fn disconnect_during_recovery_takes_the_forced_path() {
    let h = Harness::offloaded(test_config()).await;
    h.coprocessor.set_behavior(Behavior::unresponsive());

    let (req, handle) = interrupt_in(8);
    h.hcd.submit(req).unwrap();
    util::settle().await;

    h.hcd.pre_recovery();
    h.hcd.disconnect().await.unwrap();
    assert_eq!(handle.wait().await.unwrap().status, TransferStatus::PeerError);
    assert_eq!(h.hcd.current_state(), ControllerState::Origin);
    assert_eq!(h.hcd.stats().forced_recoveries, 1);
}
