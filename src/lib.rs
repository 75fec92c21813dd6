//! interp-bridge library
//!
//! A TCP bridge that lets remote clients drive a stateful command interpreter:
//! - Length-prefixed JSON framing and the request/response protocol
//! - Chunked file transfer with declared sizes
//! - Server dispatcher with serialized executor access
//! - Client session and cancellable background prep jobs

pub mod cancel;
pub mod client;
pub mod config;
pub mod error;
pub mod executor;
pub mod job;
pub mod server;
pub mod transfer;
pub mod transport;

pub use client::Client;
pub use error::{Error, Result};
pub use executor::Executor;
pub use server::{Server, ServerHandle, StopSignal};
