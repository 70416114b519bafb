pub mod action;
pub mod actions;
pub mod config;
pub mod cron;
pub mod dispatch;
pub mod error;
pub mod gate;
pub mod instance;
pub mod io;
pub mod ledger;
pub mod poller;
pub mod retry;
pub mod scheduler;
pub mod tagging;
pub mod task;

pub use error::{OpsError, Result};
