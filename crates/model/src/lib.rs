//! An abstraction layer for chat-style LLM APIs.
//!
//! This crate establishes an unified protocol for talking to a hosted
//! chat model: the messages that go in, the request options, the tool
//! schemas the model may call, and the events that come back while a
//! response is streamed.
//!
//! Types in this crate don't define any behavior, instead they are the
//! constraints that the provider implementors should adhere to. The
//! caller-facing client lives in `colloquy-core`.

#![deny(missing_docs)]

mod error;
mod message;
mod provider;
mod request;
mod response;

pub use error::*;
pub use message::*;
pub use provider::*;
pub use request::*;
pub use response::*;
