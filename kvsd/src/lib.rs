//! # kvsd — shared-memory key-value server
//!
//! An in-memory key–value server operated by many concurrent client
//! processes sharing one dataset through a shared-memory segment.
//! Clients speak a line protocol (GET, PUT, DEL, BEG, END, SUB, OP,
//! QUIT) over TCP; a secondary port translates HTTP/1.0 requests into
//! the same commands and answers as JSON. The dataset survives restarts
//! via a CSV snapshot.
//!
//! ## Module Structure
//!
//! - [`command`] - command table, parser, dispatcher and formatter
//! - [`storage`] - GET/PUT/DEL/COUNT engine, snapshots, snapshot worker
//! - [`lock`] - BEG/END exclusive mode
//! - [`newsletter`] - SUB, subscriber registry and observer processes
//! - [`net`] - accept/fork loop and line-protocol client handler
//! - [`http`] - REST adapter and static file server
//! - [`exec`] - OP external program executor
//! - [`server`] - process-initialized context and wiring
//! - [`process`] - fork/signal/process-title plumbing

pub mod command;
pub mod error;
pub mod exec;
pub mod http;
pub mod lock;
pub mod net;
pub mod newsletter;
pub mod process;
pub mod server;
pub mod storage;

pub use command::{Command, CommandTable};
pub use error::{ServerError, ServerResult};
pub use server::Server;
