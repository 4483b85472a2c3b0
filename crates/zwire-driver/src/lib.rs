//! Tokio shell for the zwire Z-Wave host driver.
//!
//! `zwire-core` holds the protocol machines; this crate gives them a
//! runtime: a serial (or TCP) byte transport, validated driver options,
//! and the [`Driver`] facade whose event loop executes the actions the
//! machines return.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod driver;
pub mod env;
pub mod options;
pub mod transport;

pub use driver::{Driver, DriverEvent, SendOptions};
pub use env::SystemEnv;
pub use options::{Attempts, DriverOptions, InclusionUserCallbacks, StorageOptions, Timeouts};
pub use transport::{
    Endpoint, EndpointBinding, IoTransport, SerialBinding, SerialTransport,
};
