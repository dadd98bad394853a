// --- File: reduction.rs ---
// Two-stage on-device count of available grass. Stage 1 leaves one partial
// per work-group in the scratch region; stage 2 folds them in a single group
// and writes the grass field of the stats record.
use crate::accel::{ComputeZone, NdRange, PendingRead, QueueId};
use crate::binder::BoundKernels;
use crate::buffers::{DeviceBuffers, STATS_LABEL};
use crate::constants::{COMPUTE_QUEUE, TRANSFER_QUEUE};
use crate::error::{Error, Result};
use crate::kernels::{Cell, StatsRecord};
use crate::worksize::WorkSizePlan;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReductionEngine {
    stage1: NdRange,
    stage2: NdRange,
    queue: QueueId,
}

impl ReductionEngine {
    pub fn new(plan: &WorkSizePlan) -> Self {
        Self {
            stage1: plan.reduce_stage1,
            stage2: plan.reduce_stage2,
            queue: COMPUTE_QUEUE,
        }
    }

    pub fn enqueue_stage1<Z: ComputeZone>(
        &self,
        zone: &Z,
        kernels: &BoundKernels<Z>,
        wait: &[Z::Event],
    ) -> Result<Z::Event> {
        zone.enqueue_kernel(self.queue, &kernels.reduce_stage1, self.stage1, wait)
    }

    pub fn enqueue_stage2<Z: ComputeZone>(
        &self,
        zone: &Z,
        kernels: &BoundKernels<Z>,
        wait: &[Z::Event],
    ) -> Result<Z::Event> {
        zone.enqueue_kernel(self.queue, &kernels.reduce_stage2, self.stage2, wait)
    }

    // Run both stages after `wait` and block for the result.
    pub fn count_blocking<Z: ComputeZone>(
        &self,
        zone: &Z,
        kernels: &BoundKernels<Z>,
        buffers: &DeviceBuffers<Z>,
        wait: &[Z::Event],
    ) -> Result<u32> {
        let partial = self.enqueue_stage1(zone, kernels, wait)?;
        let total = self.enqueue_stage2(zone, kernels, &[partial])?;
        let (read, mut readback) = read_grass(zone, buffers, &[total])?;
        zone.wait(&[read])?;
        let bytes = readback
            .try_take()?
            .ok_or_else(|| Error::sync(STATS_LABEL, "read-back not delivered after completion"))?;
        decode_grass(&bytes)
    }
}

// Enqueue the read-back of the grass field of the stats record.
pub fn read_grass<Z: ComputeZone>(
    zone: &Z,
    buffers: &DeviceBuffers<Z>,
    wait: &[Z::Event],
) -> Result<(Z::Event, Z::Readback)> {
    zone.enqueue_read(
        TRANSFER_QUEUE,
        &buffers.stats,
        StatsRecord::GRASS_OFFSET,
        std::mem::size_of::<u32>(),
        wait,
    )
}

pub fn decode_grass(bytes: &[u8]) -> Result<u32> {
    bytemuck::try_pod_read_unaligned::<u32>(bytes).map_err(|e| {
        Error::sync(
            STATS_LABEL,
            format!("read-back of {} bytes is not one counter: {e:?}", bytes.len()),
        )
    })
}

pub fn serial_count(cells: &[Cell]) -> u32 {
    cells.iter().filter(|cell| cell.is_available()).count() as u32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn serial_count_counts_zero_timers() {
        let cells: Vec<Cell> = [0, 3, 0, 1, 0].iter().map(|&grass| Cell { grass }).collect();
        assert_eq!(serial_count(&cells), 3);
        assert_eq!(serial_count(&[]), 0);
    }

    #[test]
    fn decode_rejects_wrong_width() {
        assert_eq!(decode_grass(&7u32.to_ne_bytes()).unwrap(), 7);
        assert!(decode_grass(&[1, 2]).is_err());
    }
}
// --- End of File: reduction.rs ---
