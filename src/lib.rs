//! Credit-aware rotation of a single GPU workload across a pool of platform accounts.

pub mod config;
pub mod db;
pub mod error;
pub mod monitor;
pub mod orchestrator;
pub mod platform;
pub mod services;

#[cfg(test)]
mod testing;
