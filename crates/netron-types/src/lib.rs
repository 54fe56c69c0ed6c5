//! Core types for the Netron distributed-object protocol.
//!
//! This crate defines the data structures shared by every Netron component:
//! definitions, wire values, errors and configuration. It contains no I/O.

pub mod config;
pub mod definition;
pub mod error;
pub mod value;

pub use config::NetronConfig;
pub use definition::{ContextDescriptor, DefId, Definition};
pub use error::{NetronError, NetronResult, RemoteError};
pub use value::WireValue;
