pub mod admission;
pub mod cache;
pub mod config;
pub mod grid;
pub mod ledger;
pub mod limits;
pub mod maintenance;
pub mod model;
pub mod notify;
pub mod observability;
pub mod pool;
pub mod sql;
pub mod tls;
pub mod wal;
pub mod wire;
