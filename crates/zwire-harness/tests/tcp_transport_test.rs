//! The driver over TCP, inside a Turmoil network simulation: the same
//! framing and scheduler flow, with a remote stick instead of a local
//! port.

use std::io;
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use zwire_driver::{Driver, DriverOptions, IoTransport, SendOptions, SerialBinding};
use zwire_harness::mock::{serve_stream, MockState};
use zwire_proto::Message;

struct TurmoilBinding;

#[async_trait]
impl SerialBinding for TurmoilBinding {
    type Transport = IoTransport<turmoil::net::TcpStream>;

    async fn open(&mut self) -> io::Result<Self::Transport> {
        let stream = turmoil::net::TcpStream::connect("controller:4001").await?;
        Ok(IoTransport::new(stream))
    }
}

#[test]
fn controller_over_tcp() {
    let mut sim = turmoil::Builder::new().build();

    sim.host("controller", || async {
        let listener = turmoil::net::TcpListener::bind("0.0.0.0:4001").await?;
        let state = Arc::new(Mutex::new(MockState::default()));
        loop {
            let (stream, _) = listener.accept().await?;
            // No injection channel needed for this scenario.
            let (_inject_tx, mut inject_rx) = tokio::sync::mpsc::unbounded_channel();
            serve_stream(stream, &state, &mut inject_rx, false).await;
        }
    });

    sim.client("host", async {
        let mut options = DriverOptions::default();
        options.enable_soft_reset = false;

        let (driver, _events) = Driver::start(TurmoilBinding, options)
            .await
            .map_err(|error| -> Box<dyn std::error::Error> { Box::new(error) })?;

        let response = driver
            .send_message(Message::get_controller_version(), SendOptions::default())
            .await
            .map_err(|error| -> Box<dyn std::error::Error> { Box::new(error) })?;
        let response = response.expect("version query has a response");
        assert!(response.payload.starts_with(b"Z-Wave"));

        driver.destroy().await;
        Ok(())
    });

    sim.run().unwrap();
}
