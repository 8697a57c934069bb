//! Reverse proxy fronting a fleet of worker nodes. Target selection is
//! delegated to a load-balancing policy which a multi-armed-bandit
//! agent retunes online from observed execution reports.

pub mod mab;
pub mod policy;
pub mod proxy;
pub mod stats;

pub use mab::MabAgent;
pub use policy::{build_policy, LbPolicy, PolicyKind, Target};
pub use proxy::LbProxy;
pub use stats::{LbStats, StatsDelta};
