// --- File: kernels.rs ---
// Device-side data layouts and the fixed kernel signatures both zones expose.
use crate::accel::MemAccess;
use crate::config::SimulationParameters;
use crate::constants::{GRASS_KERNEL, REDUCE_GRASS1_KERNEL, REDUCE_GRASS2_KERNEL};
use bytemuck::{Pod, Zeroable};

// --- GPU Data Structures ---
// These structs MUST match the layout the kernels read.
// `repr(C)` keeps field order; all fields are u32 so there is no padding.

#[repr(C)]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Pod, Zeroable)]
pub struct DeviceSimParams {
    pub size_x: u32,
    pub size_y: u32,
    pub size_xy: u32,
    pub max_agents: u32,
    pub grass_restart: u32,
}

impl DeviceSimParams {
    pub fn new(params: &SimulationParameters, max_agents: usize) -> Self {
        let shape = params.shape();
        Self {
            size_x: shape.x,
            size_y: shape.y,
            size_xy: shape.x * shape.y,
            // RunConfig::validate keeps this within u32
            max_agents: u32::try_from(max_agents).unwrap_or(u32::MAX),
            grass_restart: params.grass_restart,
        }
    }
}

// One grid cell: ticks left before the grass is edible again (0 = edible).
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct Cell {
    pub grass: u32,
}

impl Cell {
    #[inline]
    pub fn is_available(&self) -> bool {
        self.grass == 0
    }
}

// Per-iteration statistics record, one row of the output file.
#[repr(C)]
#[derive(Debug, Copy, Clone, Default, PartialEq, Eq, Pod, Zeroable)]
pub struct StatsRecord {
    pub sheep: u32,
    pub wolves: u32,
    pub grass: u32,
}

impl StatsRecord {
    // Byte offset of the field the final reduction stage writes.
    pub const GRASS_OFFSET: usize = std::mem::offset_of!(StatsRecord, grass);
    // Index of the same field when the record is viewed as `u32` words.
    pub const GRASS_WORD: usize = Self::GRASS_OFFSET / std::mem::size_of::<u32>();
}

// --- Kernel Signatures ---

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum ArgKind {
    /// Global buffer, with what the kernel does to it
    Buffer(MemAccess),
    // Work-group local scratch; the size is given at bind time
    Local,
    /// Plain value passed by copy, exactly this many bytes
    Scalar(usize),
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct KernelSignature {
    pub name: &'static str,
    pub args: &'static [ArgKind],
}

const SIM_PARAMS_BYTES: usize = std::mem::size_of::<DeviceSimParams>();

// grass(grid, sim_params, rng_seeds)
pub const GRASS_SIGNATURE: KernelSignature = KernelSignature {
    name: GRASS_KERNEL,
    args: &[
        ArgKind::Buffer(MemAccess::ReadWrite),
        ArgKind::Scalar(SIM_PARAMS_BYTES),
        ArgKind::Buffer(MemAccess::ReadWrite),
    ],
};

// reduce_grass1(grid, partials, local scratch, sim_params)
pub const REDUCE_GRASS1_SIGNATURE: KernelSignature = KernelSignature {
    name: REDUCE_GRASS1_KERNEL,
    args: &[
        ArgKind::Buffer(MemAccess::ReadOnly),
        ArgKind::Buffer(MemAccess::WriteOnly),
        ArgKind::Local,
        ArgKind::Scalar(SIM_PARAMS_BYTES),
    ],
};

// reduce_grass2(partials, local scratch, stats)
pub const REDUCE_GRASS2_SIGNATURE: KernelSignature = KernelSignature {
    name: REDUCE_GRASS2_KERNEL,
    args: &[
        ArgKind::Buffer(MemAccess::ReadOnly),
        ArgKind::Local,
        ArgKind::Buffer(MemAccess::WriteOnly),
    ],
};

pub const PROGRAM: [KernelSignature; 3] = [
    GRASS_SIGNATURE,
    REDUCE_GRASS1_SIGNATURE,
    REDUCE_GRASS2_SIGNATURE,
];

pub fn signature(name: &str) -> Option<&'static KernelSignature> {
    PROGRAM.iter().find(|sig| sig.name == name)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sim_params_layout_matches_device_struct() {
        assert_eq!(std::mem::size_of::<DeviceSimParams>(), 20);
        assert_eq!(std::mem::offset_of!(DeviceSimParams, size_x), 0);
        assert_eq!(std::mem::offset_of!(DeviceSimParams, size_y), 4);
        assert_eq!(std::mem::offset_of!(DeviceSimParams, size_xy), 8);
        assert_eq!(std::mem::offset_of!(DeviceSimParams, max_agents), 12);
        assert_eq!(std::mem::offset_of!(DeviceSimParams, grass_restart), 16);
    }

    #[test]
    fn stats_record_layout() {
        assert_eq!(std::mem::size_of::<StatsRecord>(), 12);
        assert_eq!(StatsRecord::GRASS_OFFSET, 8);
        assert_eq!(StatsRecord::GRASS_WORD, 2);
        assert_eq!(std::mem::size_of::<Cell>(), 4);
    }

    #[test]
    fn sim_params_mirror_parameters() {
        let params = SimulationParameters {
            grid_x: 3,
            grid_y: 5,
            init_sheep: 1,
            init_wolves: 1,
            grass_restart: 9,
            iters: 2,
        };
        let dev = DeviceSimParams::new(&params, 64);
        assert_eq!(dev.size_xy, 15);
        assert_eq!(dev.max_agents, 64);
        assert_eq!(bytemuck::bytes_of(&dev).len(), SIM_PARAMS_BYTES);
    }

    #[test]
    fn program_exposes_three_entry_points() {
        assert!(signature("grass").is_some());
        assert_eq!(signature("reduce_grass1").unwrap().args.len(), 4);
        assert_eq!(signature("reduce_grass2").unwrap().args.len(), 3);
        assert!(signature("move_agents").is_none());
    }
}
// --- End of File: kernels.rs ---
