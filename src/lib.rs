//! Polling and change-reconciliation core for the WarEra community bot.
//!
//! Shared by the long-running `warwatch` daemon and the one-shot
//! `poll_once` tool.

pub mod client;
pub mod config;
pub mod fetcher;
pub mod jobs;
pub mod scoring;
pub mod sink;
pub mod store;
