//! Gopherbot: a ChatOps robot that routes chat messages to plugins, jobs
//! and tasks, runs them in pipelines and keeps long-term memories in a
//! pluggable brain.

pub mod api;
pub mod base64_file;
pub mod bot;
pub mod brain;
pub mod builtins;
pub mod catalog;
pub mod cli;
pub mod config;
pub mod connector;
pub mod dispatch;
pub mod env;
pub mod error;
pub mod events;
pub mod exclusive;
pub mod history;
pub mod linebuffer;
pub mod logging;
pub mod message;
pub mod pipeline;
pub mod prompt;
pub mod retval;
pub mod robot;
pub mod rpc;
pub mod scheduler;
pub mod subscriptions;

#[cfg(test)]
mod testing;

pub use error::{Error, Result};
pub use retval::{RetVal, TaskRetVal};
