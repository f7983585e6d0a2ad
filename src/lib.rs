//! Mail scheduler: scheduled sending and reply reconciliation.

pub mod accounts;
pub mod clock;
pub mod config;
pub mod engine;
pub mod error;
pub mod store;
