// --- File: main.rs ---
use anyhow::Context;
use clap::{Parser, ValueEnum};
use predprey::constants::{
    DEFAULT_PARAMS_FILE, DEFAULT_SEED, DEFAULT_STATS_FILE, HOST_DEFAULT_MAX_WORK_GROUP,
    HOST_DEFAULT_QUEUES, MAX_AGENTS, MIN_QUEUES,
};
use predprey::{ComputeZone, HostZone, RunConfig, RunReport, SimulationParameters, SyncPolicy, WgpuZone};
use std::path::PathBuf;

#[derive(Debug, Copy, Clone, PartialEq, Eq, ValueEnum)]
enum Backend {
    /// Software zone: one worker thread per queue, kernels on rayon
    Host,
    /// First GPU adapter wgpu can find
    Wgpu,
}

/// Run the grass-growth stage of the PPHPC predator-prey model.
#[derive(Debug, Parser)]
#[command(version)]
struct Cli {
    /// Parameter file (PPHPC key = value format)
    #[arg(short, long, default_value = DEFAULT_PARAMS_FILE)]
    params: PathBuf,

    /// Where to write the per-iteration statistics
    #[arg(short, long, default_value = DEFAULT_STATS_FILE)]
    stats: PathBuf,

    /// Seed for the host random generator
    #[arg(short = 'r', long, default_value_t = DEFAULT_SEED)]
    seed: u64,

    #[arg(long, value_enum, default_value_t = SyncPolicy::Strict)]
    sync: SyncPolicy,

    /// Work-group size; defaults to the device maximum
    #[arg(long)]
    local_size: Option<usize>,

    /// Collect per-event timings and print a report (forces strict sync)
    #[arg(long)]
    profile: bool,

    /// Capacity of the device RNG seed pool
    #[arg(long, default_value_t = MAX_AGENTS)]
    max_agents: usize,

    #[arg(long, value_enum, default_value_t = Backend::Wgpu)]
    backend: Backend,

    /// Queues exposed by the host backend
    #[arg(long, default_value_t = HOST_DEFAULT_QUEUES)]
    host_queues: usize,

    /// Maximum work-group size reported by the host backend
    #[arg(long, default_value_t = HOST_DEFAULT_MAX_WORK_GROUP)]
    host_max_group: usize,
}

impl Cli {
    fn run_config(&self) -> RunConfig {
        RunConfig {
            seed: self.seed,
            sync: self.sync,
            profiling: self.profile,
            local_size: self.local_size,
            max_agents: self.max_agents,
            output: Some(self.stats.clone()),
        }
    }
}

fn simulate<Z: ComputeZone>(
    zone: &mut Z,
    params: &SimulationParameters,
    config: &RunConfig,
) -> anyhow::Result<RunReport> {
    let report = predprey::run(zone, params, config)?;
    Ok(report)
}

fn execute(cli: &Cli) -> anyhow::Result<()> {
    let params = SimulationParameters::from_file(&cli.params)
        .with_context(|| format!("loading parameters from {}", cli.params.display()))?;
    let config = cli.run_config();
    log::info!(
        "Grid {}x{}, {} iterations, grass restart {}, seed {}",
        params.grid_x,
        params.grid_y,
        params.iters,
        params.grass_restart,
        config.seed
    );

    let report = match cli.backend {
        Backend::Host => {
            let mut zone = HostZone::builder()
                .queues(cli.host_queues)
                .max_work_group_size(cli.host_max_group)
                .build()
                .context("starting host compute zone")?;
            simulate(&mut zone, &params, &config)?
        }
        Backend::Wgpu => {
            let mut zone = WgpuZone::open(MIN_QUEUES).context("opening GPU compute zone")?;
            simulate(&mut zone, &params, &config)?
        }
    };

    if let Some(profile) = &report.profile {
        println!("{profile}");
    }
    if let Some(last) = report.stats.last() {
        log::info!(
            "Final row: {} sheep, {} wolves, {} grass ({:?} sync)",
            last.sheep,
            last.wolves,
            last.grass,
            report.policy
        );
    }
    Ok(())
}

fn main() {
    env_logger::Builder::from_env(env_logger::Env::default().default_filter_or("info")).init();
    let cli = Cli::parse();
    if let Err(err) = execute(&cli) {
        log::error!("{err:#}");
        std::process::exit(1);
    }
}
// --- End of File: main.rs ---
