//! Client for the drover job queue. A `Client` reserves jobs over a secured
//! request/reply socket, executes them as supervised child processes, and
//! reports their final disposition back with retry-safe semantics.

pub mod config;
pub mod mount;

mod client;
mod execute;

pub use client::{Client, RpcError, ERR_MUST_RESERVE};
pub use config::ClientConfig;
pub use mount::{Behaviours, Mounter, NoBehaviours, NoMounts};
