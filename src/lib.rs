//! mcp-fleet keeps a configured set of MCP tool servers running as child
//! processes and applies configuration edits without a restart.
//!
//! The crate is organized around a small set of collaborating layers:
//! - [`core::config`] loads the server document and environment file into
//!   immutable snapshots, diffs them, and watches both files for edits.
//! - [`supervisor`] owns one runtime instance per server: spawning, exit
//!   monitoring, automatic restarts, reconciliation and status reporting.
//! - [`mcp`] speaks the Model Context Protocol over a child's stdio to
//!   discover and invoke tools.
//! - [`core::fleet`] wires the three together behind a single owner.
//!
//! Runtime entrypoints live in the binary crate (`src/main.rs`) and route
//! through [`crate::cli::main`].

pub mod cli;
pub mod core;
pub mod mcp;
pub mod supervisor;
