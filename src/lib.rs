pub mod configure;
pub mod error;
pub mod ledger;
pub mod logger;
pub mod models;
pub mod retry;
pub mod simple_kv_storage;
pub mod sync;
