//! S2 resynchronization: an undecodable envelope triggers exactly one
//! Nonce Report per failure window, and a repeated failure mid-bootstrap
//! cancels the bootstrap.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use zwire_driver::{Driver, DriverEvent, DriverOptions, InclusionUserCallbacks};
use zwire_harness::{mock_binding, MockHandle};
use zwire_proto::{cc, NodeId};

async fn start_with_s2() -> (Driver, MockHandle) {
    let (binding, mock) = mock_binding();
    let mut options = DriverOptions::default();
    options.enable_soft_reset = false;
    options.security_keys.s2_unauthenticated = Some([0x11; 16]);
    options.security_keys.s2_authenticated = Some([0x22; 16]);
    let (driver, _events) = Driver::start(binding, options).await.unwrap();
    (driver, mock)
}

/// An S2 Message Encapsulation nobody can decode (no SPAN exists).
fn bogus_s2_envelope() -> Vec<u8> {
    let mut pdu = vec![cc::SECURITY_2, 0x03];
    pdu.push(0x01); // sequence
    pdu.push(0x00); // no extensions
    pdu.extend_from_slice(&[0xDE, 0xAD, 0xBE, 0xEF, 0x01, 0x02, 0x03, 0x04, 0x05, 0x06]);
    pdu
}

#[tokio::test(start_paused = true)]
async fn no_span_triggers_a_single_nonce_report() {
    let (driver, mock) = start_with_s2().await;

    mock.inject_pdu(NodeId(9), &bogus_s2_envelope());

    assert!(mock.wait_for_sent(NodeId(9), 1, Duration::from_secs(3)).await);
    let sent = mock.sent_to(NodeId(9));
    assert_eq!(sent.len(), 1);
    // S2 Nonce Report with the singlecast-out-of-sync flag and our EI.
    assert_eq!(sent[0][0], cc::SECURITY_2);
    assert_eq!(sent[0][1], 0x02);
    assert_eq!(sent[0][3] & 0x01, 0x01);
    assert_eq!(sent[0].len(), 2 + 2 + 16);

    // A second failure in the same window does not enqueue another.
    mock.inject_pdu(NodeId(9), &bogus_s2_envelope());
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(mock.sent_to(NodeId(9)).len(), 1);

    driver.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn repeated_failure_mid_bootstrap_cancels_and_fires_abort_hook() {
    let (binding, mock) = mock_binding();
    let aborted = Arc::new(AtomicBool::new(false));

    let mut options = DriverOptions::default();
    options.enable_soft_reset = false;
    options.security_keys.s2_unauthenticated = Some([0x11; 16]);
    options.inclusion_user_callbacks = Some(InclusionUserCallbacks {
        grant_security_classes: Arc::new(|requested| requested),
        validate_dsk_and_enter_pin: Arc::new(|_| None),
        abort: {
            let aborted = Arc::clone(&aborted);
            Arc::new(move || aborted.store(true, Ordering::SeqCst))
        },
    });
    let (driver, mut events) = Driver::start(binding, options).await.unwrap();
    driver.set_bootstrap_key(Some([0x77; 16])).await.unwrap();

    // First failure: resynchronization attempt, bootstrap still alive.
    mock.inject_pdu(NodeId(9), &bogus_s2_envelope());
    assert!(mock.wait_for_sent(NodeId(9), 1, Duration::from_secs(3)).await);
    assert_eq!(mock.sent_to(NodeId(9))[0][1], 0x02);
    assert!(!aborted.load(Ordering::SeqCst));

    // Repeated failure: the bootstrap is canceled with a KEX Fail and the
    // user hook fires.
    mock.inject_pdu(NodeId(9), &bogus_s2_envelope());
    assert!(mock.wait_for_sent(NodeId(9), 2, Duration::from_secs(3)).await);
    let sent = mock.sent_to(NodeId(9));
    assert_eq!(sent[1], vec![cc::SECURITY_2, 0x07, 0x06]);
    assert!(aborted.load(Ordering::SeqCst));

    loop {
        match tokio::time::timeout(Duration::from_secs(2), events.recv()).await {
            Ok(Some(DriverEvent::BootstrapAborted { node_id })) => {
                assert_eq!(node_id, NodeId(9));
                break;
            },
            Ok(Some(_)) => continue,
            other => panic!("expected a bootstrap-aborted event: {other:?}"),
        }
    }

    driver.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn s2_nonce_get_is_always_answered() {
    let (driver, mock) = start_with_s2().await;

    mock.inject_pdu(NodeId(9), &[cc::SECURITY_2, 0x01, 0x01]);

    assert!(mock.wait_for_sent(NodeId(9), 1, Duration::from_secs(3)).await);
    let sent = mock.sent_to(NodeId(9));
    assert_eq!(sent[0][0], cc::SECURITY_2);
    assert_eq!(sent[0][1], 0x02);

    driver.destroy().await;
}
