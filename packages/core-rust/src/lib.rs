//! Replication manager core: identifiers, GTID sets, state machine, error
//! catalog, crash log, and binlog arithmetic shared by the control plane.

pub mod binlog;
pub mod catalog;
pub mod crash;
pub mod gtid;
pub mod hash;
pub mod replication;
pub mod signal;
pub mod state;
pub mod types;
pub mod version;

pub use catalog::{ErrFrom, ErrType};
pub use crash::{Crash, CrashLog};
pub use gtid::{Gtid, GtidList};
pub use replication::{ChangeSourceOptions, IoThread, MasterStatus, ReplicationMode, ReplicationStatus};
pub use signal::NonBlockingChannel;
pub use state::{State, StateDiff, StateMachine};
pub use types::{Cookie, JobState, JobTask, MonitorStatus, ProxyType, ServerState, Topology};
pub use version::{DbVersion, Flavor};
