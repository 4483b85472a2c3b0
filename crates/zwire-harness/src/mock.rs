//! A scripted controller module.
//!
//! Speaks the Serial API over any byte stream: ACKs data frames, answers
//! identification queries, executes SendData with per-node scripted radio
//! outcomes, and performs the soft-reset dance (announce SerialApiStarted,
//! optionally dropping the line first like a USB stick rebooting).
//!
//! [`mock_binding`] wires it to the driver through an in-memory duplex
//! that supports reconnection, so the driver's reopen path is exercised
//! for real. [`serve_stream`] is stream-generic so the same controller
//! can sit behind a Turmoil TCP socket.

use std::collections::HashMap;
use std::io;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, DuplexStream};
use tokio::sync::mpsc;

use zwire_driver::{IoTransport, SerialBinding};
use zwire_proto::{
    message::inbound, ControlByte, DataFrame, Framer, FunctionType, NodeId, SerialItem,
    TransmitStatus,
};

/// Scripted radio behavior for one node.
#[derive(Debug, Clone, Copy)]
pub struct NodeBehavior {
    /// Transmit status reported in SendData callbacks
    pub transmit_status: TransmitStatus,
    /// Swallow the callback entirely (stuck radio)
    pub suppress_callback: bool,
}

impl Default for NodeBehavior {
    fn default() -> Self {
        Self { transmit_status: TransmitStatus::Ok, suppress_callback: false }
    }
}

/// Shared controller state, visible to tests through [`MockHandle`].
#[derive(Default)]
pub struct MockState {
    nodes: HashMap<NodeId, NodeBehavior>,
    sent: Vec<(NodeId, Vec<u8>)>,
    soft_resets: u32,
    drop_on_soft_reset: bool,
}

/// Test-side handle: script behaviors, inject traffic, inspect sends.
#[derive(Clone)]
pub struct MockHandle {
    state: Arc<Mutex<MockState>>,
    inject: mpsc::UnboundedSender<Vec<u8>>,
}

impl MockHandle {
    /// Script a node's radio behavior.
    pub fn set_node(&self, node_id: NodeId, behavior: NodeBehavior) {
        self.state.lock().unwrap().nodes.insert(node_id, behavior);
    }

    /// Make the next soft reset drop the connection (USB stick style).
    pub fn set_drop_on_soft_reset(&self, drop: bool) {
        self.state.lock().unwrap().drop_on_soft_reset = drop;
    }

    /// Every SendData PDU received, in arrival order.
    pub fn sent(&self) -> Vec<(NodeId, Vec<u8>)> {
        self.state.lock().unwrap().sent.clone()
    }

    /// SendData PDUs addressed to one node, in arrival order.
    pub fn sent_to(&self, node_id: NodeId) -> Vec<Vec<u8>> {
        self.state
            .lock()
            .unwrap()
            .sent
            .iter()
            .filter(|(node, _)| *node == node_id)
            .map(|(_, pdu)| pdu.clone())
            .collect()
    }

    /// Number of soft resets performed.
    pub fn soft_resets(&self) -> u32 {
        self.state.lock().unwrap().soft_resets
    }

    /// Write raw bytes to the host.
    pub fn inject_raw(&self, bytes: Vec<u8>) {
        let _ = self.inject.send(bytes);
    }

    /// Deliver a controller→host frame.
    pub fn inject_frame(&self, frame: &DataFrame) {
        self.inject_raw(frame.encode_to_vec().expect("mock frames encode"));
    }

    /// Deliver an unsolicited command class PDU from a node.
    pub fn inject_pdu(&self, from: NodeId, pdu: &[u8]) {
        self.inject_frame(&inbound::application_command(from, pdu));
    }

    /// Poll until `count` SendData PDUs reached `node_id` or `timeout`
    /// (virtual time) passes. Returns whether the count was reached.
    pub async fn wait_for_sent(&self, node_id: NodeId, count: usize, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.sent_to(node_id).len() >= count {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }
}

/// Reconnectable in-memory binding: every `open` creates a fresh duplex
/// whose far side is handed to the running mock task.
pub struct MockBinding {
    connect: mpsc::UnboundedSender<DuplexStream>,
}

#[async_trait]
impl SerialBinding for MockBinding {
    type Transport = IoTransport<DuplexStream>;

    async fn open(&mut self) -> io::Result<Self::Transport> {
        let (near, far) = tokio::io::duplex(4096);
        self.connect
            .send(far)
            .map_err(|_| io::Error::new(io::ErrorKind::ConnectionRefused, "mock is gone"))?;
        Ok(IoTransport::new(near))
    }
}

/// Spawn a mock controller; returns the driver-side binding and the
/// test-side handle.
pub fn mock_binding() -> (MockBinding, MockHandle) {
    let (connect_tx, mut connect_rx) = mpsc::unbounded_channel::<DuplexStream>();
    let (inject_tx, mut inject_rx) = mpsc::unbounded_channel::<Vec<u8>>();
    let state = Arc::new(Mutex::new(MockState::default()));

    let task_state = Arc::clone(&state);
    tokio::spawn(async move {
        let mut announce_on_connect = false;
        while let Some(stream) = connect_rx.recv().await {
            let dropped_for_reset =
                serve_stream(stream, &task_state, &mut inject_rx, announce_on_connect).await;
            // A reset-dropped line announces SerialApiStarted on the next
            // connection, the way a rebooting stick does.
            announce_on_connect = dropped_for_reset;
        }
    });

    (MockBinding { connect: connect_tx }, MockHandle { state, inject: inject_tx })
}

/// Serve one connection. Returns `true` when the connection was dropped
/// on purpose to simulate a post-reset reboot.
pub async fn serve_stream<S>(
    stream: S,
    state: &Arc<Mutex<MockState>>,
    inject: &mut mpsc::UnboundedReceiver<Vec<u8>>,
    announce_on_connect: bool,
) -> bool
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    let (mut reader, mut writer) = tokio::io::split(stream);
    let mut framer = Framer::new();
    let mut buffer = [0u8; 256];

    if announce_on_connect {
        write_frame(&mut writer, &serial_api_started_frame()).await;
    }

    loop {
        tokio::select! {
            read = reader.read(&mut buffer) => match read {
                Ok(0) | Err(_) => return false,
                Ok(count) => {
                    for item in framer.feed(&buffer[..count]) {
                        if let SerialItem::Frame(frame) = item {
                            if handle_frame(&frame, state, &mut writer).await {
                                return true;
                            }
                        }
                        // Host control bytes (ACK/NAK) need no reaction.
                    }
                },
            },
            injected = inject.recv() => match injected {
                Some(bytes) => {
                    if writer.write_all(&bytes).await.is_err() {
                        return false;
                    }
                },
                None => return false,
            },
        }
    }
}

/// Process one host→controller frame. Returns `true` to drop the line.
async fn handle_frame<W: AsyncWrite + Unpin>(
    frame: &DataFrame,
    state: &Arc<Mutex<MockState>>,
    writer: &mut W,
) -> bool {
    let _ = writer.write_all(&[ControlByte::Ack as u8]).await;

    let data = &frame.data;
    if data.len() < 2 {
        return false;
    }

    match FunctionType::from_u8(data[1]) {
        Some(FunctionType::SoftReset) => {
            let drop_line = {
                let mut state = state.lock().unwrap();
                state.soft_resets += 1;
                state.drop_on_soft_reset
            };
            if drop_line {
                return true;
            }
            write_frame(writer, &serial_api_started_frame()).await;
        },
        Some(FunctionType::GetControllerVersion) => {
            write_frame(
                writer,
                &inbound::response(FunctionType::GetControllerVersion, b"Z-Wave 7.00\0\x07"),
            )
            .await;
        },
        Some(FunctionType::MemoryGetId) => {
            write_frame(
                writer,
                &inbound::response(FunctionType::MemoryGetId, &[0xDE, 0xAD, 0xBE, 0xEF, 0x01]),
            )
            .await;
        },
        Some(FunctionType::SendData) => {
            // node, pdu length, pdu..., options, callback id
            if data.len() < 6 {
                return false;
            }
            let node_id = NodeId(data[2]);
            let pdu_len = data[3] as usize;
            if data.len() < 4 + pdu_len + 2 {
                return false;
            }
            let pdu = data[4..4 + pdu_len].to_vec();
            let callback_id = *data.last().expect("length checked");

            let behavior = {
                let mut state = state.lock().unwrap();
                state.sent.push((node_id, pdu));
                state.nodes.get(&node_id).copied().unwrap_or_default()
            };

            write_frame(writer, &inbound::response(FunctionType::SendData, &[0x01])).await;
            if callback_id != 0 && !behavior.suppress_callback {
                write_frame(
                    writer,
                    &inbound::send_data_callback(callback_id, behavior.transmit_status),
                )
                .await;
            }
        },
        Some(FunctionType::SendDataAbort) => {
            write_frame(writer, &inbound::response(FunctionType::SendDataAbort, &[0x01])).await;
        },
        Some(function) if function.expects_response() => {
            write_frame(writer, &inbound::response(function, &[0x01])).await;
        },
        _ => {},
    }
    false
}

fn serial_api_started_frame() -> DataFrame {
    DataFrame::new(0x00, FunctionType::SerialApiStarted.to_u8(), &[0x01, 0x00])
}

async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, frame: &DataFrame) {
    let bytes = frame.encode_to_vec().expect("mock frames encode");
    let _ = writer.write_all(&bytes).await;
}
