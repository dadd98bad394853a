// --- File: mod.rs ---
// A compute zone is a device with in-order command queues. Cloning an event
// retains it and dropping any handle releases it; the ledger counts both.

pub mod host;
mod host_kernels;
pub mod ledger;
pub mod wgpu_zone;

pub use host::{HostZone, HostZoneBuilder};
pub use ledger::{HandleCounts, HandleKind, HandleLedger, Tracked};
pub use wgpu_zone::WgpuZone;

use crate::error::{Error, Result};
use crate::kernels::{ArgKind, KernelSignature};
use std::sync::Arc;

pub type QueueId = usize;

#[derive(Debug, Clone)]
pub struct DeviceInfo {
    pub name: String,
    pub backend: String,
    pub max_work_group_size: usize,
}

// Access pattern from the device's point of view
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum MemAccess {
    ReadOnly,
    WriteOnly,
    ReadWrite,
}

impl MemAccess {
    /// Whether a buffer created with `self` may be bound where a kernel
    /// needs `needed`.
    pub fn permits(self, needed: MemAccess) -> bool {
        self == MemAccess::ReadWrite || self == needed
    }
}

#[derive(Debug, Clone)]
pub struct BufferDesc {
    pub label: &'static str,
    pub size: usize, // Bytes
    pub access: MemAccess,
}

// 1-D launch geometry
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct NdRange {
    pub global: usize,
    pub local: usize,
}

impl NdRange {
    pub fn groups(&self) -> usize {
        self.global / self.local
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct ProgramOptions {
    pub local_size: usize,
}

pub enum KernelArg<'a, B> {
    Buffer(&'a B),
    // Work-group local scratch of this many bytes
    Local(usize),
    Scalar(&'a [u8]),
}

impl<B> KernelArg<'_, B> {
    fn kind_name(&self) -> &'static str {
        match self {
            KernelArg::Buffer(_) => "buffer",
            KernelArg::Local(_) => "local scratch",
            KernelArg::Scalar(_) => "scalar",
        }
    }
}

// Nanoseconds since the zone was created
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EventTimes {
    pub queued: u64,
    pub start: u64,
    pub end: u64,
}

impl EventTimes {
    pub fn duration(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }
}

pub trait PendingRead {
    /// Bytes read from the device; `Ok(None)` while still in flight.
    fn try_take(&mut self) -> Result<Option<Vec<u8>>>;
}

pub trait ComputeZone {
    type Buffer;
    type Kernel;
    type Event: Clone;
    type Readback: PendingRead;

    fn info(&self) -> &DeviceInfo;

    fn num_queues(&self) -> usize;

    fn build_program(&mut self, options: &ProgramOptions) -> Result<()>;

    fn create_buffer(&self, desc: &BufferDesc) -> Result<Self::Buffer>;

    fn create_kernel(&self, name: &str) -> Result<Self::Kernel>;

    fn set_arg(
        &self,
        kernel: &mut Self::Kernel,
        index: u32,
        arg: KernelArg<'_, Self::Buffer>,
    ) -> Result<()>;

    fn enqueue_write(
        &self,
        queue: QueueId,
        buffer: &Self::Buffer,
        offset: usize,
        data: &[u8],
        wait: &[Self::Event],
    ) -> Result<Self::Event>;

    fn enqueue_kernel(
        &self,
        queue: QueueId,
        kernel: &Self::Kernel,
        range: NdRange,
        wait: &[Self::Event],
    ) -> Result<Self::Event>;

    fn enqueue_read(
        &self,
        queue: QueueId,
        buffer: &Self::Buffer,
        offset: usize,
        len: usize,
        wait: &[Self::Event],
    ) -> Result<(Self::Event, Self::Readback)>;

    fn wait(&self, events: &[Self::Event]) -> Result<()>;

    fn finish(&self, queue: QueueId) -> Result<()>;

    // None while pending
    fn event_times(&self, event: &Self::Event) -> Option<EventTimes>;

    fn ledger(&self) -> Arc<HandleLedger>;

    fn live_handles(&self) -> HandleCounts {
        self.ledger().snapshot()
    }
}

// --- Shared Validation ---

pub(crate) fn check_arg<B>(
    signature: &KernelSignature,
    index: u32,
    arg: &KernelArg<'_, B>,
) -> Result<()> {
    let Some(expected) = signature.args.get(index as usize) else {
        return Err(Error::bind(
            signature.name,
            index,
            format!("kernel takes {} arguments", signature.args.len()),
        ));
    };
    match (expected, arg) {
        (ArgKind::Buffer(_), KernelArg::Buffer(_)) => Ok(()),
        (ArgKind::Local, KernelArg::Local(bytes)) if *bytes > 0 => Ok(()),
        (ArgKind::Local, KernelArg::Local(_)) => Err(Error::bind(
            signature.name,
            index,
            "local scratch size must be non-zero",
        )),
        (ArgKind::Scalar(size), KernelArg::Scalar(bytes)) if bytes.len() == *size => Ok(()),
        (ArgKind::Scalar(size), KernelArg::Scalar(bytes)) => Err(Error::bind(
            signature.name,
            index,
            format!("scalar is {} bytes, kernel expects {}", bytes.len(), size),
        )),
        (expected, got) => Err(Error::bind(
            signature.name,
            index,
            format!("expected {:?}, got {}", expected, got.kind_name()),
        )),
    }
}

// Check a buffer's creation access against what the kernel does with it.
pub(crate) fn check_access(
    signature: &KernelSignature,
    index: u32,
    label: &str,
    access: MemAccess,
) -> Result<()> {
    match signature.args.get(index as usize) {
        Some(ArgKind::Buffer(needed)) if !access.permits(*needed) => Err(Error::bind(
            signature.name,
            index,
            format!("buffer '{label}' is {access:?}, kernel needs {needed:?}"),
        )),
        _ => Ok(()),
    }
}

pub(crate) fn check_range(kernel: &str, range: NdRange, max_work_group_size: usize) -> Result<()> {
    let reason = if range.local == 0 || range.global == 0 {
        Some("work sizes must be non-zero".to_string())
    } else if range.local > max_work_group_size {
        Some(format!(
            "local size {} exceeds device maximum {}",
            range.local, max_work_group_size
        ))
    } else if range.global % range.local != 0 {
        Some(format!(
            "global size {} is not a multiple of local size {}",
            range.global, range.local
        ))
    } else {
        None
    };
    match reason {
        Some(reason) => Err(Error::enqueue(
            format!("kernel launch (gws={} lws={})", range.global, range.local),
            kernel,
            reason,
        )),
        None => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::kernels::{GRASS_SIGNATURE, REDUCE_GRASS1_SIGNATURE, REDUCE_GRASS2_SIGNATURE};

    #[test]
    fn scalar_size_mismatch_is_a_bind_error() {
        let short = [0u8; 8];
        let err = check_arg::<()>(&GRASS_SIGNATURE, 1, &KernelArg::Scalar(&short)).unwrap_err();
        assert!(matches!(err, Error::ArgumentBind { index: 1, .. }));
    }

    #[test]
    fn wrong_kind_and_out_of_range_index_are_rejected() {
        assert!(check_arg::<()>(&GRASS_SIGNATURE, 0, &KernelArg::Local(16)).is_err());
        assert!(check_arg(&GRASS_SIGNATURE, 3, &KernelArg::Buffer(&())).is_err());
        assert!(check_arg::<()>(&REDUCE_GRASS1_SIGNATURE, 2, &KernelArg::Local(0)).is_err());
        assert!(check_arg::<()>(&REDUCE_GRASS1_SIGNATURE, 2, &KernelArg::Local(1024)).is_ok());
    }

    #[test]
    fn buffer_access_must_cover_kernel_use() {
        use MemAccess::*;
        // reduce_grass2 reads partials (arg 0) and writes stats (arg 2)
        assert!(check_access(&REDUCE_GRASS2_SIGNATURE, 0, "partials", ReadWrite).is_ok());
        assert!(check_access(&REDUCE_GRASS2_SIGNATURE, 0, "partials", ReadOnly).is_ok());
        assert!(check_access(&REDUCE_GRASS2_SIGNATURE, 2, "stats", WriteOnly).is_ok());
        let err = check_access(&REDUCE_GRASS2_SIGNATURE, 0, "stats", WriteOnly).unwrap_err();
        assert!(matches!(err, Error::ArgumentBind { index: 0, .. }));
        assert!(err.to_string().contains("stats"));
        assert!(check_access(&REDUCE_GRASS2_SIGNATURE, 2, "grid", ReadOnly).is_err());
        // grass updates the grid in place
        assert!(check_access(&GRASS_SIGNATURE, 0, "grid", WriteOnly).is_err());
        assert!(!ReadOnly.permits(ReadWrite));
    }

    #[test]
    fn launch_geometry_checks() {
        let ok = NdRange { global: 512, local: 256 };
        assert!(check_range("grass", ok, 256).is_ok());
        assert_eq!(ok.groups(), 2);
        assert!(check_range("grass", NdRange { global: 500, local: 256 }, 256).is_err());
        assert!(check_range("grass", NdRange { global: 512, local: 512 }, 256).is_err());
        assert!(check_range("grass", NdRange { global: 0, local: 1 }, 256).is_err());
    }
}
// --- End of File: mod.rs ---
