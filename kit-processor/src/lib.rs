pub mod alerts;
pub mod checkpoint;
pub mod classifier;
pub mod config;
pub mod dedup;
pub mod error;
pub mod escalation;
pub mod kafka;
pub mod memory;
pub mod metrics_consts;
pub mod partition_worker;
pub mod postgres;
pub mod reader;
pub mod service;
pub mod store;
