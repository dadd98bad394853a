// --- File: config.rs ---
use crate::constants::{DEFAULT_SEED, DEFAULT_STATS_FILE, MAX_AGENTS};
use crate::error::{Error, Result};
use glam::UVec2;
use serde::Deserialize;
use std::path::{Path, PathBuf};

// --- Simulation Parameters ---
// Loaded once from the parameter file and never mutated afterwards.
// The file is the PPHPC `key = value` format; keys this engine does not model
// (sheep_gain_from_food, wolves_reproduce_prob, ...) are accepted and ignored.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
pub struct SimulationParameters {
    pub grid_x: u32,
    pub grid_y: u32,
    pub init_sheep: u32,
    pub init_wolves: u32,
    pub grass_restart: u32, // Regrowth delay in ticks
    pub iters: u32,
}

impl SimulationParameters {
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::io(path.display().to_string(), e))?;
        Self::from_str(&content)
    }

    #[allow(clippy::should_implement_trait)]
    pub fn from_str(content: &str) -> Result<Self> {
        let params: Self = toml::from_str(content)
            .map_err(|e| Error::Config(format!("invalid parameter file: {e}")))?;
        params.validate()?;
        Ok(params)
    }

    pub fn validate(&self) -> Result<()> {
        if self.shape().min_element() == 0 {
            return Err(Error::Config(format!(
                "grid must be at least 1x1, got {}x{}",
                self.grid_x, self.grid_y
            )));
        }
        if self.grass_restart == 0 {
            return Err(Error::Config("grass_restart must be at least 1".into()));
        }
        if self.cell_count() > u32::MAX as usize {
            return Err(Error::Config(format!(
                "grid {}x{} has more cells than a 32-bit index can address",
                self.grid_x, self.grid_y
            )));
        }
        Ok(())
    }

    pub fn shape(&self) -> UVec2 {
        UVec2::new(self.grid_x, self.grid_y)
    }

    pub fn cell_count(&self) -> usize {
        let shape = self.shape();
        shape.x as usize * shape.y as usize
    }
}

// --- Synchronization Discipline ---
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, clap::ValueEnum)]
pub enum SyncPolicy {
    /// Drain both queues after every iteration
    #[default]
    Strict,
    /// Let iteration i+1 start while iteration i is still in flight
    Pipelined,
}

// --- Run Configuration ---
// Runtime switches for what used to be compile-time toggles.
#[derive(Debug, Clone)]
pub struct RunConfig {
    pub seed: u64,
    pub sync: SyncPolicy,
    pub profiling: bool,
    pub local_size: Option<usize>, // Overrides the device maximum when set
    pub max_agents: usize,         // Capacity of the RNG seed pool
    pub output: Option<PathBuf>,   // None keeps the series in memory only
}

impl Default for RunConfig {
    fn default() -> Self {
        Self {
            seed: DEFAULT_SEED,
            sync: SyncPolicy::Strict,
            profiling: false,
            local_size: None,
            max_agents: MAX_AGENTS,
            output: Some(PathBuf::from(DEFAULT_STATS_FILE)),
        }
    }
}

impl RunConfig {
    pub fn new() -> Self {
        Self::default()
    }

    // Policy actually used for the run. Profiling needs every event
    // attributed to a single iteration, which only the strict policy gives.
    pub fn effective_sync(&self) -> SyncPolicy {
        if self.profiling && self.sync == SyncPolicy::Pipelined {
            log::warn!("Profiling requested: forcing strict synchronization instead of pipelined");
            SyncPolicy::Strict
        } else {
            self.sync
        }
    }

    pub fn validate(&self, params: &SimulationParameters) -> Result<()> {
        if self.max_agents == 0 {
            return Err(Error::Config("agent capacity must be at least 1".into()));
        }
        // The kernels receive the capacity as a 32-bit field
        if u32::try_from(self.max_agents).is_err() {
            return Err(Error::Config(format!(
                "agent capacity {} does not fit the device's 32-bit field",
                self.max_agents
            )));
        }
        let agents = params.init_sheep as usize + params.init_wolves as usize;
        if agents > self.max_agents {
            return Err(Error::Config(format!(
                "initial population {} exceeds agent capacity {}",
                agents, self.max_agents
            )));
        }
        if self.local_size == Some(0) {
            return Err(Error::Config("local size override must be at least 1".into()));
        }
        Ok(())
    }
}

// --- End of File: config.rs ---
