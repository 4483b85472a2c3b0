//! Deterministic test harness for the zwire driver.
//!
//! Provides:
//!
//! - [`SimEnv`]: a seeded-RNG [`zwire_core::env::Environment`], so failing
//!   scenarios replay byte-for-byte
//! - [`mock`]: a scripted controller module speaking the Serial API over
//!   any byte stream, plus a reconnectable in-memory binding
//!
//! The scenario tests under `tests/` drive the full driver against the
//! mock with Tokio's paused clock, so every timeout in the scheduler and
//! the transport service elapses in virtual time.

#![forbid(unsafe_code)]
#![deny(missing_docs)]

pub mod mock;
pub mod sim_env;

pub use mock::{mock_binding, MockBinding, MockHandle, NodeBehavior};
pub use sim_env::SimEnv;
