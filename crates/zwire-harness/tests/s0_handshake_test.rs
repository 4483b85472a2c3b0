//! S0 pre-transmit handshake: a secure send with no cached nonce runs a
//! Nonce Get round-trip first, then goes out encapsulated.

use std::time::Duration;

use zwire_core::{
    node::Node,
    security::SecurityClass,
};
use zwire_driver::{Driver, DriverOptions, SendOptions};
use zwire_harness::mock_binding;
use zwire_proto::{cc, Command, NodeId};

#[tokio::test(start_paused = true)]
async fn secure_send_runs_nonce_handshake_first() {
    let (binding, mock) = mock_binding();
    let mut options = DriverOptions::default();
    options.enable_soft_reset = false;
    options.security_keys.s0_legacy = Some([0x42; 16]);
    let (driver, _events) = Driver::start(binding, options).await.unwrap();

    let mut node = Node::new(NodeId(7));
    node.highest_security_class = Some(SecurityClass::S0Legacy);
    driver.configure_node(node).await.unwrap();

    let secure_send = driver.send_command(
        Command::new(0x20, 0x01, NodeId(7), vec![0xFF]),
        SendOptions::default(),
    );

    // First wire traffic is the Nonce Get, not the command.
    assert!(mock.wait_for_sent(NodeId(7), 1, Duration::from_secs(3)).await);
    assert_eq!(mock.sent_to(NodeId(7))[0], vec![cc::SECURITY, 0x40]);

    // The node reports a nonce; the blocked send resumes encapsulated.
    let mut report = vec![cc::SECURITY, 0x80];
    report.extend_from_slice(&[0x11, 0x22, 0x33, 0x44, 0x55, 0x66, 0x77, 0x88]);
    mock.inject_pdu(NodeId(7), &report);

    assert!(secure_send.await.unwrap().is_some());
    let sent = mock.sent_to(NodeId(7));
    assert_eq!(sent.len(), 2);
    assert_eq!(sent[1][0], cc::SECURITY);
    assert_eq!(sent[1][1], 0x81); // Message Encapsulation
    // sender nonce (8) + ciphertext (>= 2) + nonce id + MAC (8)
    assert!(sent[1].len() >= 2 + 8 + 2 + 1 + 8);
    // The plaintext never appears on the wire.
    assert!(!sent[1].windows(3).any(|window| window == [0x20, 0x01, 0xFF]));

    driver.destroy().await;
}
