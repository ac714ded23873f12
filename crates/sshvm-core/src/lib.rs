//! `sshvm-core` — VM lifecycle orchestration for the sshvm front door.
//!
//! Everything that touches the host lives here: IPv4 allocation out of the
//! VM CIDR, the bridge/TAP/NAT fabric, the Firecracker monitor API client,
//! per-VM instance supervision, and the reference-counted VM manager.
//! The SSH surface that drives this crate lives in `sshvm-gateway`.

pub mod config;
pub mod fabric;
pub mod firecracker;
pub mod instance;
pub mod ippool;
pub mod manager;
pub mod stats;

pub use config::Config;
pub use fabric::NetworkFabric;
pub use instance::VmInstance;
pub use ippool::IpPool;
pub use manager::{CapacityError, CreateCancelled, VmManager};
pub use stats::{UserStat, UserStats};
