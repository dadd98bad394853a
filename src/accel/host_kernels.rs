// --- File: host_kernels.rs ---
// Host implementations of the three device kernels. Each work-group gets its
// own zeroed local array; barrier phases of the tree reduction run as
// sequential passes over that array, work-groups run in parallel on rayon.
use super::NdRange;
use super::host::{BoundArg, BufferGuard, HostBuffer};
use crate::constants::{GRASS_KERNEL, REDUCE_GRASS1_KERNEL, REDUCE_GRASS2_KERNEL};
use crate::kernels::{DeviceSimParams, StatsRecord};
use bytemuck::Pod;
use rayon::prelude::*;

pub(super) type KernelFn = fn(NdRange, &[BoundArg]) -> Result<(), String>;

pub(super) fn lookup(name: &str) -> Option<KernelFn> {
    match name {
        GRASS_KERNEL => Some(grass as KernelFn),
        REDUCE_GRASS1_KERNEL => Some(reduce_grass1 as KernelFn),
        REDUCE_GRASS2_KERNEL => Some(reduce_grass2 as KernelFn),
        _ => None,
    }
}

// --- Argument Access ---

fn buffer_arg(args: &[BoundArg], index: usize) -> Result<&HostBuffer, String> {
    match args.get(index) {
        Some(BoundArg::Buffer(buffer)) => Ok(buffer),
        other => Err(format!("argument {index} is not a buffer: {other:?}")),
    }
}

fn local_arg(args: &[BoundArg], index: usize, local: usize) -> Result<(), String> {
    match args.get(index) {
        Some(BoundArg::Local(bytes)) if *bytes >= local * std::mem::size_of::<u32>() => Ok(()),
        Some(BoundArg::Local(bytes)) => Err(format!(
            "local scratch of {bytes} bytes cannot hold {local} work-items"
        )),
        other => Err(format!("argument {index} is not local scratch: {other:?}")),
    }
}

fn scalar_arg<T: Pod>(args: &[BoundArg], index: usize) -> Result<T, String> {
    match args.get(index) {
        Some(BoundArg::Scalar(bytes)) => bytemuck::try_pod_read_unaligned(bytes)
            .map_err(|e| format!("argument {index} has the wrong size: {e:?}")),
        other => Err(format!("argument {index} is not a scalar: {other:?}")),
    }
}

// Lock two distinct buffers in address order, returned in argument order.
fn lock_pair<'a>(
    a: &'a HostBuffer,
    b: &'a HostBuffer,
) -> Result<(BufferGuard<'a>, BufferGuard<'a>), String> {
    if a.same_as(b) {
        return Err(format!("buffer '{}' bound to two arguments", a.label()));
    }
    if a.addr() < b.addr() {
        let first = a.lock();
        let second = b.lock();
        Ok((first, second))
    } else {
        let second = b.lock();
        let first = a.lock();
        Ok((first, second))
    }
}

// Barrier-phased tree reduction over one work-group's local array. Works for
// any group size: the stride starts at half the next power of two and lanes
// whose partner falls past the end sit the phase out.
pub(super) fn tree_reduce(lanes: &mut [u32]) -> u32 {
    let n = lanes.len();
    if n == 0 {
        return 0;
    }
    let mut stride = n.next_power_of_two() / 2;
    while stride > 0 {
        for lid in 0..stride {
            if lid + stride < n {
                lanes[lid] += lanes[lid + stride];
            }
        }
        stride /= 2;
    }
    lanes[0]
}

// --- Kernels ---

// grass(grid, sim_params, rng_seeds)
fn grass(range: NdRange, args: &[BoundArg]) -> Result<(), String> {
    let grid = buffer_arg(args, 0)?;
    let params: DeviceSimParams = scalar_arg(args, 1)?;
    buffer_arg(args, 2)?; // Seed pool is bound but grass growth draws no numbers

    let size_xy = params.size_xy as usize;
    let local = range.local;
    let mut cells = grid.lock();
    if cells.len() < size_xy {
        return Err(format!(
            "grid buffer holds {} cells, parameters say {}",
            cells.len(),
            size_xy
        ));
    }

    cells
        .par_chunks_mut(local)
        .take(range.groups())
        .enumerate()
        .for_each(|(group, chunk)| {
            for (lid, timer) in chunk.iter_mut().enumerate() {
                // Padding work-items past the last cell do nothing
                if group * local + lid >= size_xy {
                    break;
                }
                if *timer > 0 {
                    *timer -= 1;
                }
            }
        });
    Ok(())
}

// reduce_grass1(grid, partials, local scratch, sim_params)
fn reduce_grass1(range: NdRange, args: &[BoundArg]) -> Result<(), String> {
    let grid = buffer_arg(args, 0)?;
    let partials = buffer_arg(args, 1)?;
    let local = range.local;
    local_arg(args, 2, local)?;
    let params: DeviceSimParams = scalar_arg(args, 3)?;

    let size_xy = params.size_xy as usize;
    let groups = range.groups();
    let (cells_guard, mut sums) = lock_pair(grid, partials)?;
    let cells: &[u32] = &cells_guard;
    if cells.len() < size_xy {
        return Err(format!(
            "grid buffer holds {} cells, parameters say {}",
            cells.len(),
            size_xy
        ));
    }
    if sums.len() < groups {
        return Err(format!(
            "partials buffer holds {} entries, launch has {} work-groups",
            sums.len(),
            groups
        ));
    }

    sums[..groups]
        .par_iter_mut()
        .enumerate()
        .for_each(|(group, out)| {
            // Out-of-range work-items contribute the identity
            let mut lanes: Vec<u32> = (0..local)
                .map(|lid| {
                    let gid = group * local + lid;
                    u32::from(gid < size_xy && cells[gid] == 0)
                })
                .collect();
            *out = tree_reduce(&mut lanes);
        });
    Ok(())
}

// reduce_grass2(partials, local scratch, stats)
fn reduce_grass2(range: NdRange, args: &[BoundArg]) -> Result<(), String> {
    let partials = buffer_arg(args, 0)?;
    let local = range.local;
    local_arg(args, 1, local)?;
    let stats = buffer_arg(args, 2)?;

    if range.groups() != 1 {
        return Err(format!(
            "final reduction must run as one work-group, got {}",
            range.groups()
        ));
    }
    let (sums_guard, mut record) = lock_pair(partials, stats)?;
    let sums: &[u32] = &sums_guard;
    if record.len() <= StatsRecord::GRASS_WORD {
        return Err("stats buffer is smaller than one record".to_string());
    }

    // Each work-item first folds a strided slice, so any partial count fits
    let mut lanes: Vec<u32> = (0..local)
        .map(|lid| sums.iter().skip(lid).step_by(local).sum::<u32>())
        .collect();
    record[StatsRecord::GRASS_WORD] = tree_reduce(&mut lanes);
    Ok(())
}

// --- End of File: host_kernels.rs ---
