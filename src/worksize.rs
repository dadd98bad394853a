// --- File: worksize.rs ---
// Launch geometry for the three kernels, derived once per run from the grid
// and the device's maximum work-group size.
use crate::accel::{DeviceInfo, NdRange, ProgramOptions};
use crate::config::SimulationParameters;
use crate::error::{Error, Result};
use crate::utils::round_up;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WorkSizePlan {
    pub cells: usize,
    pub local_size: usize,
    pub grass: NdRange,
    pub reduce_stage1: NdRange,
    pub reduce_stage2: NdRange,
    // Stage-1 output length: one partial sum per work-group
    pub partials: usize,
}

impl WorkSizePlan {
    pub fn new(cells: usize, max_work_group_size: usize, local_override: Option<usize>) -> Result<Self> {
        if max_work_group_size == 0 {
            return Err(Error::device_query(
                "max work-group size",
                "device reports 0; no launch is possible",
            ));
        }
        if cells == 0 {
            return Err(Error::Config("cannot plan launches for an empty grid".into()));
        }
        let local_size = match local_override {
            Some(0) => {
                return Err(Error::Config("local size override must be at least 1".into()));
            }
            Some(size) if size > max_work_group_size => {
                return Err(Error::device_query(
                    "max work-group size",
                    format!(
                        "requested local size {} exceeds device maximum {}",
                        size, max_work_group_size
                    ),
                ));
            }
            Some(size) => size,
            None => max_work_group_size,
        };

        let global = round_up(cells, local_size);
        let partials = global / local_size;
        let plan = Self {
            cells,
            local_size,
            grass: NdRange {
                global,
                local: local_size,
            },
            reduce_stage1: NdRange {
                global,
                local: local_size,
            },
            reduce_stage2: NdRange {
                global: local_size,
                local: local_size,
            },
            partials,
        };

        if local_size == 1 {
            log::warn!("Work-group size is 1: every reduction lane works alone");
        }
        if plan.strided_fallback() {
            log::warn!(
                "{} cells exceed {} (local size squared); final reduction will stride over {} partials",
                cells,
                local_size * local_size,
                partials
            );
        }
        Ok(plan)
    }

    pub fn for_device(
        params: &SimulationParameters,
        info: &DeviceInfo,
        local_override: Option<usize>,
    ) -> Result<Self> {
        let plan = Self::new(params.cell_count(), info.max_work_group_size, local_override)?;
        log::info!(
            "Work sizes on '{}': lws={} gws(grass)={} gws(reduce1)={} partials={}",
            info.name,
            plan.local_size,
            plan.grass.global,
            plan.reduce_stage1.global,
            plan.partials
        );
        Ok(plan)
    }

    // True when one stage-2 lane per partial is not enough and lanes loop.
    pub fn strided_fallback(&self) -> bool {
        self.partials > self.local_size
    }

    pub fn program_options(&self) -> ProgramOptions {
        ProgramOptions {
            local_size: self.local_size,
        }
    }
}

// --- End of File: worksize.rs ---
