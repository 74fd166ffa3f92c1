//! Transactional façade over the storage core.

mod config;
mod core;
mod transaction;

pub use config::Config;
pub use core::Database;
pub use transaction::TxState;
