//! Transaction expiry: a queued transaction with a deadline rejects at
//! that deadline without ever touching the wire.

use std::time::Duration;

use zwire_core::{
    error::SchedulerError,
    node::{Node, NodeStatus},
    DriverError,
};
use zwire_driver::{Driver, DriverOptions, SendOptions};
use zwire_harness::mock_binding;
use zwire_proto::{Command, NodeId};

#[tokio::test(start_paused = true)]
async fn expiry_fires_while_parked_and_writes_nothing() {
    let (binding, mock) = mock_binding();
    let mut options = DriverOptions::default();
    options.enable_soft_reset = false;
    let (driver, _events) = Driver::start(binding, options).await.unwrap();

    let mut node = Node::new(NodeId(5));
    node.can_sleep = true;
    node.status = NodeStatus::Asleep;
    driver.configure_node(node).await.unwrap();

    let started = tokio::time::Instant::now();
    let expiring = driver.send_command(
        Command::new(0x20, 0x01, NodeId(5), vec![0x01]),
        SendOptions { expire: Some(Duration::from_millis(200)), ..Default::default() },
    );

    match expiring.await {
        Err(DriverError::Scheduler(SchedulerError::MessageExpired)) => {},
        other => panic!("expected MessageExpired, got {other:?}"),
    }
    assert!(started.elapsed() >= Duration::from_millis(200));
    assert!(mock.sent_to(NodeId(5)).is_empty());

    driver.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn expiry_does_not_fire_for_sent_transactions() {
    let (binding, mock) = mock_binding();
    let mut options = DriverOptions::default();
    options.enable_soft_reset = false;
    let (driver, _events) = Driver::start(binding, options).await.unwrap();

    let send = driver.send_command(
        Command::new(0x20, 0x01, NodeId(5), vec![0x01]),
        SendOptions { expire: Some(Duration::from_secs(5)), ..Default::default() },
    );
    assert!(send.await.unwrap().is_some());
    assert_eq!(mock.sent_to(NodeId(5)).len(), 1);

    driver.destroy().await;
}
