//! gldbg - a remote debugger for OpenGL applications.
//!
//! A controller process launches or attaches to a target (the debuggee)
//! with ptrace; a small runtime injected into the debuggee intercepts GL
//! calls and exposes them for inspection and single-stepping over a
//! length-prefixed binary protocol.
//!
//! * [`debugger`]: controller side, launch/attach, the process state
//!   machine and the typed session towards the runtime.
//! * [`runtime`]: injected side, per-thread records, halt policy,
//!   inbound command dispatch.
//! * [`connection`], [`transport`], [`proto`]: the shared IPC stack.

pub mod classify;
pub mod config;
pub mod connection;
pub mod debugger;
pub mod error;
pub mod log;
pub mod proto;
pub mod runtime;
pub mod transport;

pub use error::Error;
