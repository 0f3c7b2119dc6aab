//! kbind bridge
//!
//! Connects an external assignment engine to a cluster control plane:
//! - Watches execution nodes and workload units ([`sync`])
//! - Mirrors every lifecycle event into a durable store ([`mirror`])
//! - Hands workload unit events to the engine through a bounded queue
//!   ([`dispatch`], [`engine`])
//! - Actuates the engine's decisions as binding calls ([`binder`])

pub mod binder;
pub mod client;
pub mod config;
pub mod db;
pub mod dispatch;
pub mod engine;
pub mod mirror;
pub mod pool;
pub mod retry;
pub mod sync;
