//! IIOD binary protocol and session core.
//!
//! This crate contains everything between a transport's byte streams and
//! the IIO access layer:
//! - Wire framing (`wire`)
//! - The out-of-order command/response multiplexer (`responder`)
//! - Per-session resource registry + ordered teardown (`session`)
//! - The buffer multiplexer and block lifecycle (`buffer`, `demux`)
//! - The event stream forwarder (`evstream`)
//! - Opcode dispatch (`dispatch`)

#![deny(unsafe_code)]
// Allow some pedantic lints that are intentional in this crate
#![allow(clippy::cast_possible_truncation)]
#![allow(clippy::cast_sign_loss)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::missing_errors_doc)]

pub mod buffer;
pub mod demux;
mod dispatch;
pub mod evstream;
pub mod responder;
pub mod session;
pub mod wire;

pub mod prelude {
    pub use crate::responder::{CommandData, CommandHandler, IiodIo, Responder};
    pub use crate::session::{Registries, Session, SessionOptions};
    pub use crate::wire::{Command, Opcode, ResponseHeader, HDR_SIZE};
}
