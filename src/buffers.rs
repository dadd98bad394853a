// --- File: buffers.rs ---
// Device-resident regions owned by one run, plus the host-side initial state
// that is uploaded into them exactly once.
use crate::accel::{BufferDesc, ComputeZone, MemAccess};
use crate::config::SimulationParameters;
use crate::constants::TRANSFER_QUEUE;
use crate::error::Result;
use crate::kernels::{Cell, StatsRecord};
use crate::utils::random_grass_timer;
use crate::worksize::WorkSizePlan;
use rand::RngCore;

pub const STATS_LABEL: &str = "stats";
pub const GRASS_LABEL: &str = "grass matrix";
pub const PARTIALS_LABEL: &str = "reduction scratch";
pub const RNG_LABEL: &str = "rng seeds";

// --- Host-Side Initial State ---

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InitialState {
    pub grid: Vec<Cell>,
    // Row 0 of the statistics, computed on the host before any kernel runs
    pub stats: StatsRecord,
}

impl InitialState {
    // Draw the initial grass timers, cell `x + y * grid_x` in index order.
    pub fn generate<R: RngCore>(params: &SimulationParameters, rng: &mut R) -> Self {
        let shape = params.shape();
        let mut grid = Vec::with_capacity(params.cell_count());
        for _y in 0..shape.y {
            for _x in 0..shape.x {
                grid.push(Cell {
                    grass: random_grass_timer(rng, params.grass_restart),
                });
            }
        }
        let available = grid.iter().filter(|cell| cell.is_available()).count() as u32;
        Self {
            grid,
            stats: StatsRecord {
                sheep: params.init_sheep,
                wolves: params.init_wolves,
                grass: available,
            },
        }
    }
}

/// Seeds for the device-side generators. Uploading consumes the pool: once
/// handed to the device it is never read or written by the host again.
#[derive(Debug)]
pub struct RngSeedPool {
    seeds: Vec<u64>,
}

impl RngSeedPool {
    pub fn generate<R: RngCore>(rng: &mut R, capacity: usize) -> Self {
        Self {
            seeds: (0..capacity).map(|_| rng.next_u64()).collect(),
        }
    }

    pub fn len(&self) -> usize {
        self.seeds.len()
    }

    pub fn is_empty(&self) -> bool {
        self.seeds.is_empty()
    }

    pub fn byte_size(&self) -> usize {
        std::mem::size_of_val(self.seeds.as_slice())
    }

    pub fn upload<Z: ComputeZone>(self, zone: &Z, buffer: &Z::Buffer) -> Result<Z::Event> {
        zone.enqueue_write(
            TRANSFER_QUEUE,
            buffer,
            0,
            bytemuck::cast_slice(&self.seeds),
            &[],
        )
    }
}

// --- Device Regions ---

pub struct DeviceBuffers<Z: ComputeZone> {
    pub stats: Z::Buffer,
    pub grass: Z::Buffer,
    pub partials: Z::Buffer,
    pub rng: Z::Buffer,
}

// Completion events of the one-time uploads. Both must be waited on before
// the first kernel is enqueued.
pub struct UploadEvents<E> {
    pub grass: E,
    pub rng: E,
}

impl<E: Clone> UploadEvents<E> {
    pub fn both(&self) -> [E; 2] {
        [self.grass.clone(), self.rng.clone()]
    }
}

impl<Z: ComputeZone> DeviceBuffers<Z> {
    // Allocate all four regions. Sizes are fixed for the whole run.
    pub fn allocate(zone: &Z, plan: &WorkSizePlan, rng_capacity: usize) -> Result<Self> {
        let stats = zone.create_buffer(&BufferDesc {
            label: STATS_LABEL,
            size: std::mem::size_of::<StatsRecord>(),
            access: MemAccess::WriteOnly,
        })?;
        let grass = zone.create_buffer(&BufferDesc {
            label: GRASS_LABEL,
            size: plan.cells * std::mem::size_of::<Cell>(),
            access: MemAccess::ReadWrite,
        })?;
        let partials = zone.create_buffer(&BufferDesc {
            label: PARTIALS_LABEL,
            size: plan.partials * std::mem::size_of::<u32>(),
            access: MemAccess::ReadWrite,
        })?;
        let rng = zone.create_buffer(&BufferDesc {
            label: RNG_LABEL,
            size: rng_capacity * std::mem::size_of::<u64>(),
            access: MemAccess::ReadWrite,
        })?;
        log::debug!(
            "Allocated buffers: grid {} cells, {} partials, {} rng seeds",
            plan.cells,
            plan.partials,
            rng_capacity
        );
        Ok(Self {
            stats,
            grass,
            partials,
            rng,
        })
    }

    // Start both one-time uploads on the transfer queue without blocking.
    pub fn upload_initial(
        &self,
        zone: &Z,
        grid: &[Cell],
        pool: RngSeedPool,
    ) -> Result<UploadEvents<Z::Event>> {
        let grass = zone.enqueue_write(
            TRANSFER_QUEUE,
            &self.grass,
            0,
            bytemuck::cast_slice(grid),
            &[],
        )?;
        let rng = pool.upload(zone, &self.rng)?;
        Ok(UploadEvents { grass, rng })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rand::SeedableRng;
    use rand::rngs::StdRng;

    fn params() -> SimulationParameters {
        SimulationParameters {
            grid_x: 4,
            grid_y: 4,
            init_sheep: 6,
            init_wolves: 2,
            grass_restart: 3,
            iters: 5,
        }
    }

    #[test]
    fn initial_state_counts_available_cells() {
        let mut rng = StdRng::seed_from_u64(0);
        let state = InitialState::generate(&params(), &mut rng);
        assert_eq!(state.grid.len(), 16);
        let available = state.grid.iter().filter(|c| c.grass == 0).count() as u32;
        assert_eq!(state.stats.grass, available);
        assert_eq!(state.stats.sheep, 6);
        assert_eq!(state.stats.wolves, 2);
        assert!(state.grid.iter().all(|c| c.grass <= 3));
    }

    #[test]
    fn same_seed_same_initial_state() {
        let a = InitialState::generate(&params(), &mut StdRng::seed_from_u64(0));
        let b = InitialState::generate(&params(), &mut StdRng::seed_from_u64(0));
        assert_eq!(a, b);
    }

    #[test]
    fn regions_are_sized_from_the_plan() {
        use crate::accel::HostZone;
        let mut zone = HostZone::builder().build().unwrap();
        let plan = WorkSizePlan::new(16, 4, Some(3)).unwrap();
        zone.build_program(&plan.program_options()).unwrap();
        let buffers = DeviceBuffers::allocate(&zone, &plan, 32).unwrap();
        assert_eq!(buffers.stats.size(), 12);
        assert_eq!(buffers.stats.access(), MemAccess::WriteOnly);
        assert_eq!(buffers.grass.size(), 64);
        assert_eq!(buffers.partials.size(), 6 * 4);
        assert_eq!(buffers.rng.size(), 32 * 8);
        assert_eq!(buffers.rng.label(), RNG_LABEL);
    }

    #[test]
    fn seed_pool_has_requested_capacity() {
        let pool = RngSeedPool::generate(&mut StdRng::seed_from_u64(1), 32);
        assert_eq!(pool.len(), 32);
        assert_eq!(pool.byte_size(), 256);
        assert!(!pool.is_empty());
    }
}
// --- End of File: buffers.rs ---
