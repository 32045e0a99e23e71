//! RPC core library.
//!
//! Transport-agnostic JSON-RPC dispatch for devices that talk to several
//! peers at once. Transports plug in through [`rpc::channel::Channel`];
//! the embedding application owns the event loop and drives the engine.

#![deny(unused_must_use)]

pub mod config;
pub mod rpc;

mod error;

pub use error::{Error, ParseError, RegistryError, Result, RoutingError};
