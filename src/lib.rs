// --- File: lib.rs ---
// Grass-growth stage of the PPHPC predator-prey model, orchestrated on a
// compute zone with two command queues.
pub mod accel;
pub mod binder;
pub mod buffers;
pub mod config;
pub mod constants;
pub mod error;
pub mod kernels;
pub mod profiling;
pub mod reduction;
pub mod schedule;
pub mod simulation;
pub mod stats;
pub mod utils;
pub mod worksize;

pub use accel::{ComputeZone, HostZone, WgpuZone};
pub use config::{RunConfig, SimulationParameters, SyncPolicy};
pub use error::{Error, Result};
pub use kernels::StatsRecord;
pub use simulation::{RunReport, RunState, Simulation, run};
// --- End of File: lib.rs ---
