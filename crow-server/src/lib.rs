//! Crow server: the transport side of the real-time voice assistant.
//!
//! A client connects over WebSocket, streams microphone audio and/or text,
//! and receives streaming recognition results, assistant replies and
//! synthesized audio. Each connection gets a [`session::Session`] that wires
//! the [`asr`] and [`tts`] providers and the `crow` agent into one
//! interruptible pipeline.

pub mod asr;
pub mod config;
pub mod conn;
pub mod error;
pub mod frames;
pub mod server;
pub mod session;
pub mod tts;
pub mod util;

pub use error::{Result, ServerError};
pub use server::{AppState, serve};
pub use session::Session;
