// --- File: binder.rs ---
// Creates the three kernels and binds every argument that stays fixed for
// the run. Any mismatch against a kernel signature aborts startup.
use crate::accel::{ComputeZone, KernelArg};
use crate::buffers::DeviceBuffers;
use crate::constants::{GRASS_KERNEL, REDUCE_GRASS1_KERNEL, REDUCE_GRASS2_KERNEL};
use crate::error::Result;
use crate::kernels::DeviceSimParams;
use crate::worksize::WorkSizePlan;
use bytemuck::Pod;

pub struct BoundKernels<Z: ComputeZone> {
    pub grass: Z::Kernel,
    pub reduce_stage1: Z::Kernel,
    pub reduce_stage2: Z::Kernel,
}

// Bind `args` to positions 0, 1, 2, ... of `kernel`.
pub fn bind_all<Z: ComputeZone>(
    zone: &Z,
    kernel: &mut Z::Kernel,
    args: Vec<KernelArg<'_, Z::Buffer>>,
) -> Result<()> {
    for (index, arg) in args.into_iter().enumerate() {
        zone.set_arg(kernel, index as u32, arg)?;
    }
    Ok(())
}

// Replace one by-value argument between launches.
pub fn rebind_scalar<Z: ComputeZone, T: Pod>(
    zone: &Z,
    kernel: &mut Z::Kernel,
    index: u32,
    value: &T,
) -> Result<()> {
    zone.set_arg(kernel, index, KernelArg::Scalar(bytemuck::bytes_of(value)))
}

impl<Z: ComputeZone> BoundKernels<Z> {
    pub fn bind(
        zone: &Z,
        buffers: &DeviceBuffers<Z>,
        sim_params: &DeviceSimParams,
        plan: &WorkSizePlan,
    ) -> Result<Self> {
        let params_bytes = bytemuck::bytes_of(sim_params);
        let scratch_bytes = plan.local_size * std::mem::size_of::<u32>();

        let mut grass = zone.create_kernel(GRASS_KERNEL)?;
        bind_all(
            zone,
            &mut grass,
            vec![
                KernelArg::Buffer(&buffers.grass),
                KernelArg::Scalar(params_bytes),
                KernelArg::Buffer(&buffers.rng),
            ],
        )?;

        let mut reduce_stage1 = zone.create_kernel(REDUCE_GRASS1_KERNEL)?;
        bind_all(
            zone,
            &mut reduce_stage1,
            vec![
                KernelArg::Buffer(&buffers.grass),
                KernelArg::Buffer(&buffers.partials),
                KernelArg::Local(scratch_bytes),
                KernelArg::Scalar(params_bytes),
            ],
        )?;

        let mut reduce_stage2 = zone.create_kernel(REDUCE_GRASS2_KERNEL)?;
        bind_all(
            zone,
            &mut reduce_stage2,
            vec![
                KernelArg::Buffer(&buffers.partials),
                KernelArg::Local(scratch_bytes),
                KernelArg::Buffer(&buffers.stats),
            ],
        )?;

        log::debug!("Bound fixed arguments of {GRASS_KERNEL}, {REDUCE_GRASS1_KERNEL}, {REDUCE_GRASS2_KERNEL}");
        Ok(Self {
            grass,
            reduce_stage1,
            reduce_stage2,
        })
    }
}

// --- End of File: binder.rs ---
