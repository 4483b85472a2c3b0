//! Supervision wrapping: applied when the caller requests it or when the
//! node is known to support the Supervision command class.

use zwire_core::node::Node;
use zwire_driver::{Driver, DriverOptions, SendOptions};
use zwire_harness::{mock_binding, MockHandle};
use zwire_proto::{cc, Command, NodeId};

async fn start() -> (Driver, MockHandle) {
    let (binding, mock) = mock_binding();
    let mut options = DriverOptions::default();
    options.enable_soft_reset = false;
    let (driver, _events) = Driver::start(binding, options).await.unwrap();
    (driver, mock)
}

fn switch_set(node: u8) -> Command {
    Command::new(0x25, 0x01, NodeId(node), vec![0xFF])
}

#[tokio::test(start_paused = true)]
async fn capable_node_is_supervised_automatically() {
    let (driver, mock) = start().await;

    let mut node = Node::new(NodeId(5));
    node.cc_versions.insert(cc::SUPERVISION, 1);
    driver.configure_node(node).await.unwrap();

    driver.send_command(switch_set(5), SendOptions::default()).await.unwrap();

    let sent = mock.sent_to(NodeId(5));
    // Supervision Get: props, encapsulated length, inner PDU.
    assert_eq!(sent[0][0], cc::SUPERVISION);
    assert_eq!(sent[0][1], 0x01);
    assert_eq!(sent[0][3], 3);
    assert_eq!(&sent[0][4..], &[0x25, 0x01, 0xFF]);
}

#[tokio::test(start_paused = true)]
async fn explicit_request_supervises_an_unknown_node() {
    let (driver, mock) = start().await;

    let options = SendOptions { supervision: true, ..Default::default() };
    driver.send_command(switch_set(5), options).await.unwrap();

    let sent = mock.sent_to(NodeId(5));
    assert_eq!(sent[0][0], cc::SUPERVISION);
    assert_eq!(&sent[0][4..], &[0x25, 0x01, 0xFF]);
}

#[tokio::test(start_paused = true)]
async fn plain_node_is_not_supervised_by_default() {
    let (driver, mock) = start().await;

    driver.send_command(switch_set(5), SendOptions::default()).await.unwrap();

    let sent = mock.sent_to(NodeId(5));
    assert_eq!(&sent[0], &[0x25, 0x01, 0xFF]);
}
