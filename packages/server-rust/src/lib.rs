//! Replication manager control plane for MySQL and MariaDB clusters.
//!
//! A [`cluster::Cluster`] probes every node each monitoring tick, rebuilds
//! the replication topology, fails over a dead leader when the automatic
//! gates allow it, rejoins returning nodes and keeps the configured proxies
//! pointed at the current leader. [`worker::spawn_cluster`] drives the tick
//! and queued operator requests on a background task.

pub mod binlog;
pub mod cluster;
pub mod config;
pub mod context;
pub mod db;
pub mod error;
pub mod jobs;
pub mod logging;
pub mod monitor;
pub mod proxy;
pub mod traits;
pub mod worker;

pub use cluster::{Cluster, ClusterSnapshot, RejoinMethod};
pub use config::ClusterConfig;
pub use context::ClusterContext;
pub use worker::{spawn_cluster, ClusterTask};

#[cfg(test)]
mod tests {
    #[test]
    fn crate_loads() {}
}
