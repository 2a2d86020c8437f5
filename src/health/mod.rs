//! Stream liveness: probing, failure tracking and recovery scheduling

pub mod cycle;
pub mod prober;
pub mod state;

pub use cycle::{HealthChecker, HealthCycleReport};
pub use prober::{HttpStreamProbe, StreamProbe};
pub use state::{
    HealthPolicy, HealthTransition, ProbeOutcome, ProbeReport, apply_probe, health_score,
    recovery_delay,
};
