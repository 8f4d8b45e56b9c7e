//! Supertransaction executor
//!
//! Resolves a user's multi-chain instruction set into a signed, fee-quoted
//! execution plan and drives it to completion across chains and bridges.

pub mod api;
pub mod chain;
pub mod config;
pub mod coordination;
pub mod error;
pub mod instruction;
pub mod metrics;
pub mod monitor;
pub mod planner;
pub mod registry;
pub mod state;
pub mod tx;

#[cfg(test)]
mod testing;
