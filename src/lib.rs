//! Resumable chunked uploads spread across many storage servers.
//!
//! A file is split into fixed-size chunks, each chunk is placed on the best
//! scoring storage server that has room for it, failed dispatches are retried
//! elsewhere, and completed chunks are recorded in a durable ledger so an
//! interrupted upload can pick up where it stopped.

pub mod accounting;
pub mod api;
pub mod chunk;
pub mod config;
pub mod coordinator;
pub mod db;
pub mod integrity;
pub mod ledger;
pub mod metrics;
pub mod network;
pub mod progress;
pub mod registry;
