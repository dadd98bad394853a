// --- File: constants.rs ---
// --- Global Simulation Constants ---

// Hard upper bound on simultaneously alive agents. Sizes the RNG seed pool.
pub const MAX_AGENTS: usize = 1_048_576;

// Seed used when none is given, so runs are reproducible by default.
pub const DEFAULT_SEED: u64 = 0;

pub const DEFAULT_PARAMS_FILE: &str = "config.txt";
pub const DEFAULT_STATS_FILE: &str = "stats.txt";

// --- Queue Roles ---
// The zone must expose at least two independent queues.
pub const TRANSFER_QUEUE: usize = 0;
pub const COMPUTE_QUEUE: usize = 1;
pub const MIN_QUEUES: usize = 2;
// Pipelined runs block on the oldest read once more than this many are pending
pub const PIPELINE_DEPTH: usize = 2;

// --- Kernel Entry Points ---
pub const GRASS_KERNEL: &str = "grass";
pub const REDUCE_GRASS1_KERNEL: &str = "reduce_grass1";
pub const REDUCE_GRASS2_KERNEL: &str = "reduce_grass2";

// --- Host Zone Defaults ---
pub const HOST_DEFAULT_MAX_WORK_GROUP: usize = 256;
pub const HOST_DEFAULT_QUEUES: usize = 2;

// --- End of File: constants.rs ---
