//! Sleeping-node queue behavior: a radio timeout parks the node's
//! backlog, a wake-up notification releases it at original priority.

use std::time::Duration;

use zwire_core::{
    error::SchedulerError,
    node::{Node, NodeStatus},
    scheduler::transaction::Priority,
    DriverError,
};
use zwire_driver::{Driver, DriverOptions, SendOptions};
use zwire_harness::{mock_binding, MockHandle, NodeBehavior};
use zwire_proto::{Command, NodeId, TransmitStatus};

const WAKE_UP_NOTIFICATION: [u8; 2] = [0x84, 0x07];

fn battery_node(id: u8, status: NodeStatus) -> Node {
    let mut node = Node::new(NodeId(id));
    node.can_sleep = true;
    node.supports_wake_up = true;
    node.status = status;
    node
}

fn basic_set(node: u8, value: u8) -> Command {
    Command::new(0x20, 0x01, NodeId(node), vec![value])
}

async fn start() -> (Driver, MockHandle) {
    let (binding, mock) = mock_binding();
    let mut options = DriverOptions::default();
    options.enable_soft_reset = false;
    let (driver, _events) = Driver::start(binding, options).await.unwrap();
    (driver, mock)
}

#[tokio::test(start_paused = true)]
async fn node_timeout_parks_backlog_and_wakeup_releases_it_in_order() {
    let (driver, mock) = start().await;

    driver.configure_node(battery_node(5, NodeStatus::Awake)).await.unwrap();
    driver.configure_node(battery_node(6, NodeStatus::Asleep)).await.unwrap();
    mock.set_node(
        NodeId(5),
        NodeBehavior { transmit_status: TransmitStatus::NoAck, suppress_callback: false },
    );

    // Three Normal sends to node 5, plus a WakeUp-priority ping parked
    // behind sleeping node 6.
    let first = driver.send_command(basic_set(5, 0x01), SendOptions::default());
    let second = driver.send_command(basic_set(5, 0x02), SendOptions::default());
    let third = driver.send_command(basic_set(5, 0x03), SendOptions::default());
    let ping = driver.send_command(
        Command::no_op(NodeId(6)),
        SendOptions { priority: Priority::WakeUp, ..Default::default() },
    );

    // The radio reports no acknowledgement: the first send fails and the
    // node is presumed asleep.
    match first.await {
        Err(DriverError::Scheduler(SchedulerError::NodeTimeout { node_id })) => {
            assert_eq!(node_id, NodeId(5));
        },
        other => panic!("expected NodeTimeout, got {other:?}"),
    }

    // The remaining two are parked, not burned against the radio.
    tokio::time::sleep(Duration::from_millis(200)).await;
    assert_eq!(mock.sent_to(NodeId(5)).len(), 1);

    // Node 5 wakes: its backlog resumes at original priority and drains
    // before node 6's parked ping.
    mock.set_node(NodeId(5), NodeBehavior::default());
    mock.inject_pdu(NodeId(5), &WAKE_UP_NOTIFICATION);

    assert!(second.await.unwrap().is_some());
    assert!(third.await.unwrap().is_some());
    assert_eq!(mock.sent_to(NodeId(6)).len(), 0);

    mock.inject_pdu(NodeId(6), &WAKE_UP_NOTIFICATION);
    ping.await.unwrap();

    let order: Vec<NodeId> = mock.sent().iter().map(|(node, _)| *node).collect();
    assert_eq!(order, vec![NodeId(5), NodeId(5), NodeId(5), NodeId(6)]);

    // Relative order among the parked sends survived both requeues.
    let to_five = mock.sent_to(NodeId(5));
    assert_eq!(to_five[1], vec![0x20, 0x01, 0x02]);
    assert_eq!(to_five[2], vec![0x20, 0x01, 0x03]);

    driver.destroy().await;
}

#[tokio::test(start_paused = true)]
async fn sends_to_known_sleeping_node_park_immediately() {
    let (driver, mock) = start().await;
    driver.configure_node(battery_node(5, NodeStatus::Asleep)).await.unwrap();

    let parked = driver.send_command(basic_set(5, 0x01), SendOptions::default());

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert!(mock.sent_to(NodeId(5)).is_empty());

    mock.inject_pdu(NodeId(5), &WAKE_UP_NOTIFICATION);
    assert!(parked.await.unwrap().is_some());
    assert_eq!(mock.sent_to(NodeId(5)).len(), 1);

    driver.destroy().await;
}
