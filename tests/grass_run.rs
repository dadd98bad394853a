// --- File: grass_run.rs ---
// End-to-end runs on the host compute zone.
use predprey::accel::{ComputeZone, HostZone, KernelArg, PendingRead, WgpuZone};
use predprey::binder::{BoundKernels, bind_all};
use predprey::buffers::{DeviceBuffers, InitialState, RngSeedPool};
use predprey::constants::{GRASS_KERNEL, PIPELINE_DEPTH, REDUCE_GRASS2_KERNEL};
use predprey::kernels::{Cell, DeviceSimParams};
use predprey::reduction::{ReductionEngine, decode_grass, read_grass, serial_count};
use predprey::schedule::{Dependency, IterationGraph, Scheduler, Stage};
use predprey::worksize::WorkSizePlan;
use predprey::{Error, RunConfig, SimulationParameters, StatsRecord, SyncPolicy, run};
use proptest::prelude::*;
use rand::SeedableRng;
use rand::rngs::StdRng;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

fn params(grid_x: u32, grid_y: u32, iters: u32) -> SimulationParameters {
    SimulationParameters {
        grid_x,
        grid_y,
        init_sheep: 6,
        init_wolves: 3,
        grass_restart: 3,
        iters,
    }
}

fn config(sync: SyncPolicy) -> RunConfig {
    RunConfig {
        sync,
        max_agents: 64,
        output: None,
        ..RunConfig::default()
    }
}

/// Rows a correct run must produce: the initial grid comes from the same
/// seeded generator, and a cell with timer t is edible from iteration t on.
fn reference_rows(params: &SimulationParameters, seed: u64) -> Vec<StatsRecord> {
    let initial = InitialState::generate(params, &mut StdRng::seed_from_u64(seed));
    let mut timers: Vec<u32> = initial.grid.iter().map(|cell| cell.grass).collect();
    let mut rows = vec![initial.stats];
    for _ in 0..params.iters {
        for timer in timers.iter_mut() {
            *timer = timer.saturating_sub(1);
        }
        rows.push(StatsRecord {
            grass: timers.iter().filter(|&&t| t == 0).count() as u32,
            ..initial.stats
        });
    }
    rows
}

// --- Scenarios ---

#[test]
fn small_grid_matches_reference() {
    let p = params(4, 4, 5);
    let mut zone = HostZone::builder().max_work_group_size(4).build().unwrap();
    let report = run(&mut zone, &p, &config(SyncPolicy::Strict)).unwrap();
    assert_eq!(report.stats.len(), 6);
    assert_eq!(report.stats, reference_rows(&p, 0));
    // Every timer is at most grass_restart, so the whole grid is edible by the end
    assert_eq!(report.stats[5].grass, 16);
    assert!(report.stats.iter().all(|row| row.sheep == 6 && row.wolves == 3));
}

#[test]
fn pipelined_and_strict_agree() {
    let p = params(13, 7, 8);
    let mut strict_zone = HostZone::builder().max_work_group_size(8).build().unwrap();
    let strict = run(&mut strict_zone, &p, &config(SyncPolicy::Strict)).unwrap();
    let mut pipelined_zone = HostZone::builder().max_work_group_size(8).build().unwrap();
    let pipelined = run(&mut pipelined_zone, &p, &config(SyncPolicy::Pipelined)).unwrap();
    assert_eq!(pipelined.policy, SyncPolicy::Pipelined);
    assert_eq!(strict.stats, pipelined.stats);
    assert_eq!(strict.stats, reference_rows(&p, 0));
}

#[test]
fn same_seed_same_series() {
    let p = params(10, 10, 4);
    let mut cfg = config(SyncPolicy::Pipelined);
    cfg.seed = 42;
    let mut zone = HostZone::builder().build().unwrap();
    let first = run(&mut zone, &p, &cfg).unwrap();
    let second = run(&mut zone, &p, &cfg).unwrap();
    assert_eq!(first.stats, second.stats);
    assert_eq!(first.stats, reference_rows(&p, 42));
}

#[test]
fn grid_larger_than_local_size_squared_uses_strided_stage2() {
    let p = params(9, 9, 3);
    let mut zone = HostZone::builder().max_work_group_size(4).build().unwrap();
    let report = run(&mut zone, &p, &config(SyncPolicy::Strict)).unwrap();
    assert!(report.plan.strided_fallback());
    assert_eq!(report.stats, reference_rows(&p, 0));
}

#[test]
fn work_group_size_one_still_runs() {
    let p = params(5, 3, 4);
    let mut zone = HostZone::builder().max_work_group_size(1).build().unwrap();
    let report = run(&mut zone, &p, &config(SyncPolicy::Pipelined)).unwrap();
    assert_eq!(report.plan.local_size, 1);
    assert_eq!(report.stats, reference_rows(&p, 0));
}

#[test]
fn local_size_override_is_honoured() {
    let p = params(6, 5, 2);
    let mut cfg = config(SyncPolicy::Strict);
    cfg.local_size = Some(7);
    let mut zone = HostZone::builder().max_work_group_size(16).build().unwrap();
    let report = run(&mut zone, &p, &cfg).unwrap();
    assert_eq!(report.plan.local_size, 7);
    assert_eq!(report.plan.grass.global, 35);
    assert_eq!(report.stats, reference_rows(&p, 0));
}

#[test]
fn pipelined_run_keeps_live_events_bounded() {
    let p = params(16, 16, 500);
    let mut zone = HostZone::builder().max_work_group_size(16).build().unwrap();
    let ledger = zone.ledger();
    let done = AtomicBool::new(false);
    let peak = AtomicUsize::new(0);
    let report = std::thread::scope(|scope| {
        scope.spawn(|| {
            while !done.load(Ordering::Relaxed) {
                peak.fetch_max(ledger.snapshot().events, Ordering::Relaxed);
                std::thread::yield_now();
            }
        });
        let report = run(&mut zone, &p, &config(SyncPolicy::Pipelined));
        done.store(true, Ordering::Relaxed);
        report
    })
    .unwrap();
    assert_eq!(report.stats, reference_rows(&p, 0));
    // Window iterations plus the one being issued, the one just retired, and
    // events whose commands a worker has not dropped yet
    let peak = peak.into_inner();
    assert!(peak <= 4 * (PIPELINE_DEPTH + 3), "{peak} events alive at once");
}

#[test]
fn slow_transfers_do_not_change_pipelined_results() {
    let p = params(8, 8, 12);
    let mut zone = HostZone::builder()
        .max_work_group_size(8)
        .transfer_delay(Duration::from_millis(3))
        .build()
        .unwrap();
    let report = run(&mut zone, &p, &config(SyncPolicy::Pipelined)).unwrap();
    assert_eq!(report.policy, SyncPolicy::Pipelined);
    assert_eq!(report.stats, reference_rows(&p, 0));
}

#[test]
fn stats_read_must_finish_before_next_stage2() {
    let p = params(10, 10, 4);
    let reference = reference_rows(&p, 0);
    assert_ne!(reference[1].grass, reference[4].grass);

    let mut zone = HostZone::builder()
        .max_work_group_size(8)
        .transfer_delay(Duration::from_millis(100))
        .build()
        .unwrap();
    let plan = WorkSizePlan::new(p.cell_count(), 8, None).unwrap();
    zone.build_program(&plan.program_options()).unwrap();
    let initial = InitialState::generate(&p, &mut StdRng::seed_from_u64(0));
    let buffers = DeviceBuffers::allocate(&zone, &plan, 16).unwrap();
    let pool = RngSeedPool::generate(&mut StdRng::seed_from_u64(1), 16);
    let uploads = buffers.upload_initial(&zone, &initial.grid, pool).unwrap();
    let kernels = BoundKernels::bind(&zone, &buffers, &DeviceSimParams::new(&p, 16), &plan).unwrap();
    zone.wait(&uploads.both()).unwrap();
    let reduction = ReductionEngine::new(&plan);

    // Pipelined graph without ReadStats -> next ReduceStage2
    let edge = |from, to, carried| Dependency { from, to, carried };
    let edges = vec![
        edge(Stage::Grow, Stage::ReduceStage1, false),
        edge(Stage::ReduceStage1, Stage::ReduceStage2, false),
        edge(Stage::ReduceStage2, Stage::ReadStats, false),
        edge(Stage::ReadStats, Stage::ReadStats, true),
        edge(Stage::ReduceStage1, Stage::Grow, true),
    ];
    let mut scheduler = Scheduler::new(IterationGraph::from_edges(edges).unwrap());
    let mut reads = Vec::new();
    for _ in 0..p.iters {
        scheduler
            .run_iteration(|stage, wait| match stage {
                Stage::Grow => zone.enqueue_kernel(stage.queue(), &kernels.grass, plan.grass, wait),
                Stage::ReduceStage1 => reduction.enqueue_stage1(&zone, &kernels, wait),
                Stage::ReduceStage2 => reduction.enqueue_stage2(&zone, &kernels, wait),
                Stage::ReadStats => {
                    let (event, readback) = read_grass(&zone, &buffers, wait)?;
                    reads.push((event.clone(), readback));
                    Ok(event)
                }
            })
            .unwrap();
    }
    let observed: Vec<u32> = reads
        .into_iter()
        .map(|(event, mut readback)| {
            zone.wait(&[event]).unwrap();
            decode_grass(&readback.try_take().unwrap().unwrap()).unwrap()
        })
        .collect();

    // The stalled first read lands after stage 2 of the last iteration
    assert_eq!(observed[0], reference[4].grass);
    assert_ne!(observed[0], reference[1].grass);
}

#[test]
fn stats_file_has_one_line_per_row() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stats.txt");
    let p = params(4, 4, 5);
    let mut cfg = config(SyncPolicy::Strict);
    cfg.output = Some(path.clone());
    let mut zone = HostZone::builder().max_work_group_size(4).build().unwrap();
    let report = run(&mut zone, &p, &cfg).unwrap();
    assert_eq!(report.output.as_deref(), Some(path.as_path()));

    let text = std::fs::read_to_string(&path).unwrap();
    let lines: Vec<&str> = text.lines().collect();
    assert_eq!(lines.len(), 6);
    for (line, row) in lines.iter().zip(&report.stats) {
        assert_eq!(*line, format!("{}\t{}\t{}", row.sheep, row.wolves, row.grass));
    }
}

// --- Failures ---

#[test]
fn zero_max_work_group_size_fails_before_allocation() {
    let mut zone = HostZone::builder().max_work_group_size(0).build().unwrap();
    let ledger = zone.ledger();
    let err = run(&mut zone, &params(4, 4, 2), &config(SyncPolicy::Strict)).unwrap_err();
    assert!(matches!(err, Error::DeviceQuery { .. }));
    assert_eq!(ledger.snapshot().buffers, 0);
}

#[test]
fn single_queue_zone_is_a_device_error() {
    let mut zone = HostZone::builder().queues(1).build().unwrap();
    let err = run(&mut zone, &params(4, 4, 2), &config(SyncPolicy::Strict)).unwrap_err();
    assert!(matches!(err, Error::DeviceQuery { .. }));
}

#[test]
fn allocation_failure_is_reported_and_nothing_leaks() {
    let mut zone = HostZone::builder().fail_allocation("reduction scratch").build().unwrap();
    let ledger = zone.ledger();
    let err = run(&mut zone, &params(4, 4, 2), &config(SyncPolicy::Strict)).unwrap_err();
    assert!(matches!(err, Error::Allocation { .. }), "{err}");
    drop(zone);
    assert!(ledger.snapshot().all_clear());
}

#[test]
fn build_failure_is_a_compile_error() {
    let mut zone = HostZone::builder().fail_build().build().unwrap();
    let err = run(&mut zone, &params(4, 4, 2), &config(SyncPolicy::Strict)).unwrap_err();
    assert!(matches!(err, Error::Compile { .. }), "{err}");
}

#[test]
fn argument_mismatch_is_fatal() {
    let mut zone = HostZone::builder().build().unwrap();
    let plan = WorkSizePlan::new(16, 4, None).unwrap();
    zone.build_program(&plan.program_options()).unwrap();
    let buffers = DeviceBuffers::allocate(&zone, &plan, 8).unwrap();

    // Local scratch where the grid buffer belongs
    let mut grass = zone.create_kernel(GRASS_KERNEL).unwrap();
    let err = bind_all(&zone, &mut grass, vec![KernelArg::Local(16)]).unwrap_err();
    assert!(matches!(err, Error::ArgumentBind { index: 0, .. }), "{err}");

    // One argument past the end of the signature
    let mut stage2 = zone.create_kernel(REDUCE_GRASS2_KERNEL).unwrap();
    let err = zone
        .set_arg(&mut stage2, 3, KernelArg::Buffer(&buffers.stats))
        .unwrap_err();
    assert!(matches!(err, Error::ArgumentBind { index: 3, .. }), "{err}");

    // The write-only stats region where stage 2 reads its partials
    let err = zone
        .set_arg(&mut stage2, 0, KernelArg::Buffer(&buffers.stats))
        .unwrap_err();
    assert!(matches!(err, Error::ArgumentBind { index: 0, .. }), "{err}");
    assert!(err.to_string().contains("WriteOnly"), "{err}");
}

#[test]
fn launch_failure_mid_loop_aborts_without_output() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("stats.txt");
    let mut cfg = config(SyncPolicy::Strict);
    cfg.output = Some(path.clone());

    let mut zone = HostZone::builder()
        .max_work_group_size(4)
        .fail_launch(REDUCE_GRASS2_KERNEL, 3)
        .build()
        .unwrap();
    let ledger = zone.ledger();
    let err = run(&mut zone, &params(4, 4, 6), &cfg).unwrap_err();
    assert!(matches!(err, Error::Enqueue { .. }), "{err}");
    assert_eq!(err.iteration(), Some(3));
    assert!(!path.exists());
    drop(zone);
    assert!(ledger.snapshot().all_clear());
}

#[test]
fn execution_failure_surfaces_with_its_iteration() {
    for sync in [SyncPolicy::Strict, SyncPolicy::Pipelined] {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stats.txt");
        let mut cfg = config(sync);
        cfg.output = Some(path.clone());

        let mut zone = HostZone::builder()
            .max_work_group_size(4)
            .fail_execution(GRASS_KERNEL, 2)
            .build()
            .unwrap();
        let ledger = zone.ledger();
        let err = run(&mut zone, &params(4, 4, 5), &cfg).unwrap_err();
        assert!(matches!(err, Error::Sync { .. }), "{sync:?}: {err}");
        assert_eq!(err.iteration(), Some(2), "{sync:?}: {err}");
        assert!(!path.exists());
        drop(zone);
        assert!(ledger.snapshot().all_clear(), "{sync:?}");
    }
}

#[test]
fn successful_run_releases_every_handle() {
    let mut zone = HostZone::builder().max_work_group_size(8).build().unwrap();
    let ledger = zone.ledger();
    run(&mut zone, &params(8, 8, 10), &config(SyncPolicy::Pipelined)).unwrap();
    drop(zone);
    assert!(ledger.snapshot().all_clear());
    assert!(ledger.released_total() > 0);
}

// --- Reduction ---

fn device_count(cells: &[Cell], local: usize) -> u32 {
    let p = SimulationParameters {
        grid_x: cells.len() as u32,
        grid_y: 1,
        init_sheep: 0,
        init_wolves: 0,
        grass_restart: 1,
        iters: 0,
    };
    let mut zone = HostZone::builder().max_work_group_size(local).build().unwrap();
    let plan = WorkSizePlan::new(cells.len(), local, None).unwrap();
    zone.build_program(&plan.program_options()).unwrap();
    let buffers = DeviceBuffers::allocate(&zone, &plan, 4).unwrap();
    let pool = RngSeedPool::generate(&mut StdRng::seed_from_u64(0), 4);
    let uploads = buffers.upload_initial(&zone, cells, pool).unwrap();
    let kernels = BoundKernels::bind(&zone, &buffers, &DeviceSimParams::new(&p, 4), &plan).unwrap();
    ReductionEngine::new(&plan)
        .count_blocking(&zone, &kernels, &buffers, &uploads.both())
        .unwrap()
}

#[test]
fn reduction_of_all_edible_and_no_edible_grids() {
    let edible = vec![Cell { grass: 0 }; 1000];
    assert_eq!(device_count(&edible, 32), 1000);
    let growing = vec![Cell { grass: 2 }; 1000];
    assert_eq!(device_count(&growing, 32), 0);
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn reduction_matches_serial_count(
        timers in proptest::collection::vec(0u32..3, 1..2000),
        local in 1usize..65,
    ) {
        let cells: Vec<Cell> = timers.iter().map(|&grass| Cell { grass }).collect();
        prop_assert_eq!(device_count(&cells, local), serial_count(&cells));
    }
}

// --- GPU ---

#[test]
fn gpu_zone_matches_host_zone() {
    let mut gpu = match WgpuZone::open(2) {
        Ok(zone) => zone,
        Err(err) => {
            eprintln!("skipping: {err}");
            return;
        }
    };
    let p = params(37, 29, 6);
    let report = run(&mut gpu, &p, &config(SyncPolicy::Pipelined)).unwrap();
    assert_eq!(report.stats, reference_rows(&p, 0));
}
// --- End of File: grass_run.rs ---
