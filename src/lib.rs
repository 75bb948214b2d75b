pub mod anchor;
pub mod chain;
pub mod config;
pub mod digest;
pub mod error;
pub mod generation;
pub mod ledger;
pub mod reconcile;
pub mod retry;
pub mod server;
pub mod service;

#[cfg(test)]
pub(crate) mod testing;
