// --- File: simulation.rs ---
// Top-level run state machine:
// Idle -> Initializing -> Running -> Draining -> Finalizing -> Terminated.
// Every handle acquired while Initializing lives in `RunContext`, so leaving
// `drive` by any path releases it.
use crate::accel::{ComputeZone, DeviceInfo, HandleCounts, PendingRead};
use crate::binder::BoundKernels;
use crate::buffers::{DeviceBuffers, InitialState, RngSeedPool};
use crate::config::{RunConfig, SimulationParameters, SyncPolicy};
use crate::constants::{COMPUTE_QUEUE, MIN_QUEUES, PIPELINE_DEPTH, TRANSFER_QUEUE};
use crate::error::{Error, Result};
use crate::kernels::{DeviceSimParams, StatsRecord};
use crate::profiling::{ProfileReport, Profiler};
use crate::reduction::{ReductionEngine, decode_grass, read_grass};
use crate::schedule::{IterationGraph, Scheduler, Stage};
use crate::stats::StatsRecorder;
use crate::worksize::WorkSizePlan;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::collections::VecDeque;
use std::path::PathBuf;
use std::time::{Duration, Instant};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum RunState {
    Idle,
    Initializing,
    Running,
    Draining,
    Finalizing,
    Terminated,
}

#[derive(Debug, Clone)]
pub struct RunReport {
    pub stats: Vec<StatsRecord>,
    pub plan: WorkSizePlan,
    pub policy: SyncPolicy,
    pub device: DeviceInfo,
    pub profile: Option<ProfileReport>,
    pub output: Option<PathBuf>,
    pub wall_clock: Duration,
    pub transitions: Vec<RunState>,
    pub live_handles: HandleCounts,
}

// --- Run Context ---

struct RunContext<Z: ComputeZone> {
    plan: WorkSizePlan,
    buffers: DeviceBuffers<Z>,
    kernels: BoundKernels<Z>,
    reduction: ReductionEngine,
    recorder: StatsRecorder,
}

// A stats read-back that has been enqueued but not yet folded into the series.
struct InFlightRead<Z: ComputeZone> {
    iteration: u32,
    event: Z::Event,
    readback: Z::Readback,
}

// Move every completed read-back at the head of the queue into the series,
// stopping at the first one still in flight so rows arrive in order.
fn collect_ready<Z: ComputeZone>(
    recorder: &mut StatsRecorder,
    in_flight: &mut VecDeque<InFlightRead<Z>>,
) -> Result<usize> {
    let mut collected = 0;
    while let Some(front) = in_flight.front_mut() {
        let Some(bytes) = front.readback.try_take()? else {
            break;
        };
        let grass = decode_grass(&bytes).map_err(|e| e.at_iteration(front.iteration))?;
        recorder.record_grass(front.iteration, grass)?;
        log::trace!("Iteration {}: {} cells of grass available", front.iteration, grass);
        in_flight.pop_front();
        collected += 1;
    }
    Ok(collected)
}

// --- Orchestrator ---

pub struct Simulation<'z, Z: ComputeZone> {
    zone: &'z mut Z,
    params: SimulationParameters,
    config: RunConfig,
    policy: SyncPolicy,
    state: RunState,
    transitions: Vec<RunState>,
}

impl<'z, Z: ComputeZone> Simulation<'z, Z> {
    pub fn new(zone: &'z mut Z, params: SimulationParameters, config: RunConfig) -> Result<Self> {
        params.validate()?;
        config.validate(&params)?;
        let policy = config.effective_sync();
        Ok(Self {
            zone,
            params,
            config,
            policy,
            state: RunState::Idle,
            transitions: vec![RunState::Idle],
        })
    }

    pub fn state(&self) -> RunState {
        self.state
    }

    pub fn policy(&self) -> SyncPolicy {
        self.policy
    }

    fn transition(&mut self, next: RunState) {
        log::debug!("Run state {:?} -> {:?}", self.state, next);
        self.state = next;
        self.transitions.push(next);
    }

    /// Run to completion. On failure the run is still torn down: queued work
    /// is drained best-effort, every run-scoped handle is released and no
    /// output file is written.
    pub fn run(mut self) -> Result<RunReport> {
        let started = Instant::now();
        let mut profiler = Profiler::new(self.config.profiling);
        let outcome = self.drive(&mut profiler, started);
        drop(profiler);
        if outcome.is_err() {
            self.drain_after_failure();
        }
        self.transition(RunState::Terminated);
        let live = self.zone.live_handles();
        log::debug!(
            "Handles still live at exit: {} buffers, {} kernels, {} events",
            live.buffers,
            live.kernels,
            live.events
        );
        outcome.map(|mut report| {
            report.transitions = self.transitions.clone();
            report.live_handles = live;
            report
        })
    }

    fn drain_after_failure(&self) {
        let queues = self.zone.num_queues();
        for queue in [TRANSFER_QUEUE, COMPUTE_QUEUE] {
            if queue >= queues {
                continue;
            }
            if let Err(e) = self.zone.finish(queue) {
                log::warn!("Could not drain queue {queue} after failure: {e}");
            }
        }
    }

    fn drive(&mut self, profiler: &mut Profiler<Z::Event>, started: Instant) -> Result<RunReport> {
        self.transition(RunState::Initializing);
        let mut ctx = self.initialize(profiler)?;

        self.transition(RunState::Running);
        let mut scheduler = Scheduler::new(IterationGraph::new(self.policy)?);
        let mut in_flight = VecDeque::new();
        for iteration in 1..=self.params.iters {
            self.iterate(&mut ctx, &mut scheduler, &mut in_flight, profiler, iteration)
                .map_err(|e| e.at_iteration(iteration))?;
        }

        self.transition(RunState::Draining);
        self.drain(&mut ctx, &mut scheduler, &mut in_flight, profiler)?;

        self.transition(RunState::Finalizing);
        if let Some(path) = &self.config.output {
            ctx.recorder.persist(path)?;
        }
        let profile = profiler.is_enabled().then(|| profiler.report());
        let wall_clock = started.elapsed();
        log::info!(
            "Simulated {} iterations in {:.3} s",
            self.params.iters,
            wall_clock.as_secs_f64()
        );

        let RunContext { plan, recorder, .. } = ctx;
        Ok(RunReport {
            stats: recorder.into_rows(),
            plan,
            policy: self.policy,
            device: self.zone.info().clone(),
            profile,
            output: self.config.output.clone(),
            wall_clock,
            transitions: Vec::new(),
            live_handles: HandleCounts::default(),
        })
    }

    fn initialize(&mut self, profiler: &mut Profiler<Z::Event>) -> Result<RunContext<Z>> {
        let queues = self.zone.num_queues();
        if queues < MIN_QUEUES {
            return Err(Error::device_query(
                "command queues",
                format!("need {MIN_QUEUES} independent queues, zone has {queues}"),
            ));
        }
        let info = self.zone.info().clone();
        log::info!("Device: {} ({})", info.name, info.backend);
        let plan = WorkSizePlan::for_device(&self.params, &info, self.config.local_size)?;
        self.zone.build_program(&plan.program_options())?;
        let zone: &Z = &*self.zone;

        let mut rng = StdRng::seed_from_u64(self.config.seed);
        let initial = InitialState::generate(&self.params, &mut rng);
        let pool = RngSeedPool::generate(&mut rng, self.config.max_agents);

        let buffers = DeviceBuffers::allocate(zone, &plan, self.config.max_agents)?;
        let uploads = buffers.upload_initial(zone, &initial.grid, pool)?;
        profiler.track("upload grass matrix", &uploads.grass);
        profiler.track("upload rng seeds", &uploads.rng);

        let sim_params = DeviceSimParams::new(&self.params, self.config.max_agents);
        let kernels = BoundKernels::bind(zone, &buffers, &sim_params, &plan)?;

        // No kernel may run before both uploads have landed
        zone.wait(&uploads.both())?;
        drop(uploads);
        profiler.harvest(zone);

        let recorder = StatsRecorder::new(self.params.iters, initial.stats);
        log::info!(
            "Initial state: {} sheep, {} wolves, {} of {} cells with grass",
            initial.stats.sheep,
            initial.stats.wolves,
            initial.stats.grass,
            plan.cells
        );
        Ok(RunContext {
            reduction: ReductionEngine::new(&plan),
            plan,
            buffers,
            kernels,
            recorder,
        })
    }

    fn iterate(
        &self,
        ctx: &mut RunContext<Z>,
        scheduler: &mut Scheduler<Z::Event>,
        in_flight: &mut VecDeque<InFlightRead<Z>>,
        profiler: &mut Profiler<Z::Event>,
        iteration: u32,
    ) -> Result<()> {
        let zone: &Z = &*self.zone;
        let plan = &ctx.plan;
        let kernels = &ctx.kernels;
        let buffers = &ctx.buffers;
        let reduction = &ctx.reduction;

        let events = scheduler.run_iteration(|stage, wait| {
            let event = match stage {
                Stage::Grow => zone.enqueue_kernel(stage.queue(), &kernels.grass, plan.grass, wait)?,
                Stage::ReduceStage1 => reduction.enqueue_stage1(zone, kernels, wait)?,
                Stage::ReduceStage2 => reduction.enqueue_stage2(zone, kernels, wait)?,
                Stage::ReadStats => {
                    let (event, readback) = read_grass(zone, buffers, wait)?;
                    in_flight.push_back(InFlightRead {
                        iteration,
                        event: event.clone(),
                        readback,
                    });
                    event
                }
            };
            profiler.track(stage.label(), &event);
            Ok(event)
        })?;

        match self.policy {
            SyncPolicy::Strict => {
                // Surface a failed command under its own name before draining
                let issued: Vec<Z::Event> = events.iter().map(|(_, event)| event.clone()).collect();
                zone.wait(&issued)?;
                drop(issued);
                drop(events);
                zone.finish(TRANSFER_QUEUE)?;
                zone.finish(COMPUTE_QUEUE)?;
                scheduler.release_carried();
                collect_ready(&mut ctx.recorder, in_flight)?;
                if !in_flight.is_empty() {
                    return Err(Error::sync(
                        "stats read-back",
                        "not delivered after both queues were drained",
                    ));
                }
                profiler.harvest(zone);
            }
            SyncPolicy::Pipelined => {
                drop(events);
                collect_ready(&mut ctx.recorder, in_flight)?;
                // Keep the host at most PIPELINE_DEPTH iterations ahead
                while in_flight.len() > PIPELINE_DEPTH {
                    if let Some(oldest) = in_flight.front() {
                        zone.wait(std::slice::from_ref(&oldest.event))
                            .map_err(|e| e.at_iteration(oldest.iteration))?;
                    }
                    if collect_ready(&mut ctx.recorder, in_flight)? == 0 {
                        break;
                    }
                }
            }
        }
        Ok(())
    }

    fn drain(
        &self,
        ctx: &mut RunContext<Z>,
        scheduler: &mut Scheduler<Z::Event>,
        in_flight: &mut VecDeque<InFlightRead<Z>>,
        profiler: &mut Profiler<Z::Event>,
    ) -> Result<()> {
        let zone: &Z = &*self.zone;
        for read in in_flight.iter() {
            zone.wait(std::slice::from_ref(&read.event))
                .map_err(|e| e.at_iteration(read.iteration))?;
        }
        zone.finish(TRANSFER_QUEUE)?;
        zone.finish(COMPUTE_QUEUE)?;
        scheduler.release_carried();
        collect_ready(&mut ctx.recorder, in_flight)?;
        if let Some(read) = in_flight.front() {
            return Err(Error::sync("stats read-back", "not delivered after final drain")
                .at_iteration(read.iteration));
        }
        profiler.harvest(zone);
        if let Some(missing) = ctx.recorder.first_missing() {
            return Err(Error::sync(
                "stats series",
                format!("row {missing} missing after final drain"),
            ));
        }
        Ok(())
    }
}

// Convenience wrapper: validate, run and tear down in one call.
pub fn run<Z: ComputeZone>(
    zone: &mut Z,
    params: &SimulationParameters,
    config: &RunConfig,
) -> Result<RunReport> {
    Simulation::new(zone, *params, config.clone())?.run()
}

// --- End of File: simulation.rs ---
