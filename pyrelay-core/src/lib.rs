//! pyrelay core library
//!
//! Drives a Python interpreter as a long-lived peer process over a pair of
//! pipes:
//! - value codec between host values and peer text
//! - handle table tying host proxies to peer objects
//! - peer process lifecycle, output draining and interrupts
//! - a reentrant request/callback engine

pub mod bridge;
pub mod codec;
pub mod config;
pub mod error;
pub mod handles;
pub mod process;
pub mod protocol;

pub use bridge::Bridge;
pub use codec::{NdArray, Value};
pub use config::BridgeConfig;
pub use error::{BridgeError, Result};
pub use handles::{HostObject, HostRef, RemoteObject};
pub use protocol::{CallArgs, Session, MAX_CALLBACK_DEPTH};
