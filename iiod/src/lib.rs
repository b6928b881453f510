//! # IIOD
//!
//! A daemon exposing an industrial-I/O context (devices, channels,
//! attributes, sample buffers, hardware events) to remote clients over
//! a binary protocol.
//!
//! ## Architecture
//!
//! - **`iiod-core`**: thread pool with a pollable stop signal, framed
//!   transport I/O, the IIO access-layer contract, simulated context
//! - **`iiod-proto`**: the responder (out-of-order command/response
//!   multiplexing), session state, buffer multiplexer, event streams
//! - **`iiod`**: carriers (TCP, serial), CLI, daemon loop (this crate)
//!
//! The session core is carrier-agnostic: every carrier hands it a pair
//! of byte streams and a cancellation signal, nothing more.

#![deny(unsafe_code)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod config;
pub mod daemon;
pub mod transport;

// Re-export core types
pub use bytes::Bytes;
pub use iiod_core::backend::IioContext;
pub use iiod_core::error::{IiodError, Result};
pub use iiod_core::sim;
pub use iiod_proto::session::{Registries, SessionOptions};
