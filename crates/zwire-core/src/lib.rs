//! Protocol machines for the zwire Z-Wave host driver.
//!
//! This crate contains the pure logic of the driver core. It is completely
//! decoupled from I/O, enabling deterministic testing: state machines take
//! `now: Instant` as a parameter, return action lists for a driver shell to
//! execute, and emit timers as outputs instead of sleeping.
//!
//! # Architecture
//!
//! ```text
//!      ┌───────────────────────────────┐
//!      │ zwire-core                    │
//!      │ - Send Scheduler              │
//!      │ - Receive Dispatcher          │
//!      │ - Encapsulation pipeline      │
//!      │ - S0/S2 security managers     │
//!      │ - Transport Service RX/TX     │
//!      │ - Node arena + sessions       │
//!      └───────────────────────────────┘
//!         ↓                       ↓
//! ┌────────────────┐   ┌────────────────┐
//! │ zwire-harness  │   │ zwire-driver   │
//! │ - Virtual time │   │ - Tokio        │
//! │ - Seeded RNG   │   │ - Serial/TCP   │
//! │ - Mock module  │   │ - Production   │
//! └────────────────┘   └────────────────┘
//! ```
//!
//! # Key Principles
//!
//! - No I/O in core: never open a port, never call `sleep`
//! - No ambient time: `Instant` values are passed in by the shell
//! - No ambient entropy: randomness goes through the [`env::Environment`]
//!   trait
//! - Every side effect is an action the shell executes

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod dispatch;
pub mod encap;
pub mod env;
pub mod error;
pub mod node;
pub mod scheduler;
pub mod security;
pub mod storage;

pub use error::{DriverError, SchedulerError, SecurityError, StorageError};
