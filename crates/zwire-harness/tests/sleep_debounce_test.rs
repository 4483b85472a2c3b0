//! Wake-up debounce: a quiet interval-scheduled node is released to
//! sleep with WakeUpNoMoreInformation, after which its traffic parks.

use std::time::Duration;

use zwire_core::node::{Node, NodeStatus};
use zwire_driver::{Driver, DriverOptions, SendOptions};
use zwire_harness::mock_binding;
use zwire_proto::{cc, Command, NodeId};

#[tokio::test(start_paused = true)]
async fn quiet_node_gets_no_more_information_then_sleeps() {
    let (binding, mock) = mock_binding();
    let mut options = DriverOptions::default();
    options.enable_soft_reset = false;
    let (driver, _events) = Driver::start(binding, options).await.unwrap();

    let mut node = Node::new(NodeId(5));
    node.can_sleep = true;
    node.supports_wake_up = true;
    node.wake_up_interval = 3600;
    node.status = NodeStatus::Awake;
    driver.configure_node(node).await.unwrap();

    // One successful exchange, then silence.
    driver
        .send_command(Command::new(0x20, 0x01, NodeId(5), vec![0x01]), SendOptions::default())
        .await
        .unwrap();

    // The debounce elapses and the node is told to go back to sleep.
    assert!(mock.wait_for_sent(NodeId(5), 2, Duration::from_secs(3)).await);
    let sent = mock.sent_to(NodeId(5));
    assert_eq!(sent[1], vec![cc::WAKE_UP, 0x08]);

    // The node is now asleep: further traffic parks instead of sending.
    let parked = driver.send_command(
        Command::new(0x20, 0x01, NodeId(5), vec![0x02]),
        SendOptions::default(),
    );
    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(mock.sent_to(NodeId(5)).len(), 2);

    mock.inject_pdu(NodeId(5), &[0x84, 0x07]);
    parked.await.unwrap();
    assert_eq!(mock.sent_to(NodeId(5)).len(), 3);

    driver.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn keep_awake_suppresses_the_debounce() {
    let (binding, mock) = mock_binding();
    let mut options = DriverOptions::default();
    options.enable_soft_reset = false;
    let (driver, _events) = Driver::start(binding, options).await.unwrap();

    let mut node = Node::new(NodeId(5));
    node.can_sleep = true;
    node.supports_wake_up = true;
    node.wake_up_interval = 3600;
    node.keep_awake = true;
    node.status = NodeStatus::Awake;
    driver.configure_node(node).await.unwrap();

    driver
        .send_command(Command::new(0x20, 0x01, NodeId(5), vec![0x01]), SendOptions::default())
        .await
        .unwrap();

    tokio::time::sleep(Duration::from_secs(3)).await;
    // Only the original send: no WakeUpNoMoreInformation.
    assert_eq!(mock.sent_to(NodeId(5)).len(), 1);

    driver.destroy().await;
}
