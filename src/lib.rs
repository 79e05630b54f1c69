//! RBF (Replace-By-Fee) による支払いの資金調達と手数料の引き上げ。

pub mod builder;
pub mod cli;
pub mod coin_selector;
pub mod config;
pub mod error;
pub mod ledger;
pub mod payment;
pub mod pool;
pub mod replacement;
pub mod serializer;
pub mod signer;
pub mod types;

#[cfg(test)]
mod testing;
