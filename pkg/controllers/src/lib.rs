//! Background control loops: the reconciliation scheduler that drives
//! reservation lifecycles forward, and the fleet probe that keeps idle
//! server records fresh.

pub mod fleet;
pub mod occupancy;
pub mod reconciler;

pub use fleet::FleetProbe;
pub use reconciler::ReconciliationScheduler;
