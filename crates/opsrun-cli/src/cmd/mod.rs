pub mod actions;
pub mod complete;
pub mod cron;
pub mod daemon;
pub mod event;
pub mod filter;
pub mod fire;
pub mod init;
pub mod instances;
pub mod reconcile;
pub mod tick;
pub mod validate;
