//! etcd Counter - replicated HTTP counter coordinated through etcd
//!
//! Every replica serves the same counter. Increments are serialized with an etcd
//! distributed lock held across the read-modify-write; reads go to etcd without the lock.

pub mod config;
pub mod context;
pub mod coordination;
pub mod counter_codec;
pub mod error;
pub mod etcd_store;
pub mod health;
pub mod http_server;
pub mod increment_coordinator;
pub mod logging;
pub mod memory_store;
pub mod read_path;
pub mod shutdown;

pub use error::{CounterError, Result};
