// --- File: wgpu_zone.rs ---
// GPU compute zone on wgpu. wgpu exposes a single submission queue, so the
// logical queues share it; each submission's index stands in for an event and
// submission order preserves the event ordering the orchestrator relies on.
use super::ledger::{HandleKind, HandleLedger, Tracked};
use super::{
    BufferDesc, ComputeZone, DeviceInfo, EventTimes, KernelArg, MemAccess, NdRange, PendingRead,
    ProgramOptions, QueueId, check_access, check_arg, check_range,
};
use crate::error::{Error, Result};
use crate::kernels::{self, ArgKind, KernelSignature, StatsRecord};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Instant;
use wgpu::util::DeviceExt;

const GRASS_SHADER: &str = include_str!("../shaders/grass.wgsl");
const REDUCE_GRASS1_SHADER: &str = include_str!("../shaders/reduce_grass1.wgsl");
const REDUCE_GRASS2_SHADER: &str = include_str!("../shaders/reduce_grass2.wgsl");

const PENDING: u64 = u64::MAX;

fn now_ns(epoch: Instant) -> u64 {
    epoch.elapsed().as_nanos() as u64
}

fn shader_source(kernel: &str) -> Option<&'static str> {
    match kernel {
        "grass" => Some(GRASS_SHADER),
        "reduce_grass1" => Some(REDUCE_GRASS1_SHADER),
        "reduce_grass2" => Some(REDUCE_GRASS2_SHADER),
        _ => None,
    }
}

// Fill the launch-time constants into a kernel's WGSL text.
fn instantiate(source: &str, local_size: usize) -> String {
    source
        .replace("{{LOCAL_SIZE_POW2}}", &local_size.next_power_of_two().to_string())
        .replace("{{LOCAL_SIZE}}", &local_size.to_string())
        .replace("{{GRASS_WORD}}", &StatsRecord::GRASS_WORD.to_string())
}

// --- Handles ---

#[derive(Debug)]
struct BufferInner {
    buffer: wgpu::Buffer,
    label: &'static str,
    size: usize,
    access: MemAccess,
    _tracked: Tracked,
}

#[derive(Debug, Clone)]
pub struct WgpuBuffer(Arc<BufferInner>);

impl WgpuBuffer {
    pub fn label(&self) -> &'static str {
        self.0.label
    }

    pub fn access(&self) -> MemAccess {
        self.0.access
    }
}

#[derive(Debug)]
struct CompiledKernel {
    layout: wgpu::BindGroupLayout,
    pipeline: wgpu::ComputePipeline,
}

#[derive(Debug)]
enum WgpuArg {
    Buffer(WgpuBuffer),
    Local,
    Scalar(wgpu::Buffer),
}

#[derive(Debug)]
pub struct WgpuKernel {
    signature: &'static KernelSignature,
    compiled: Arc<CompiledKernel>,
    args: Vec<Option<WgpuArg>>,
    _tracked: Tracked,
}

#[derive(Debug)]
struct EventInner {
    label: String,
    submission: wgpu::SubmissionIndex,
    queued: u64,
    finished: Arc<AtomicU64>,
    _tracked: Tracked,
}

#[derive(Debug, Clone)]
pub struct WgpuEvent(Arc<EventInner>);

type MapState = Arc<Mutex<Option<std::result::Result<(), wgpu::BufferAsyncError>>>>;

pub struct WgpuReadback {
    device: Arc<wgpu::Device>,
    staging: Option<wgpu::Buffer>,
    len: usize,
    state: MapState,
}

impl PendingRead for WgpuReadback {
    fn try_take(&mut self) -> Result<Option<Vec<u8>>> {
        self.device.poll(wgpu::Maintain::Poll);
        let outcome = self.state.lock().take();
        match outcome {
            None => Ok(None),
            Some(Err(e)) => Err(Error::sync("stats read-back", e.to_string())),
            Some(Ok(())) => {
                let Some(staging) = self.staging.take() else {
                    return Ok(None);
                };
                let bytes = staging.slice(..).get_mapped_range()[..self.len].to_vec();
                staging.unmap();
                Ok(Some(bytes))
            }
        }
    }
}

struct WgpuProgram {
    local_size: usize,
    kernels: HashMap<&'static str, Arc<CompiledKernel>>,
}

// --- Zone ---

pub struct WgpuZone {
    info: DeviceInfo,
    device: Arc<wgpu::Device>,
    queue: wgpu::Queue,
    max_groups_per_dispatch: u32,
    program: Option<WgpuProgram>,
    lost: Arc<Mutex<Option<String>>>, // First uncaptured device error
    ledger: Arc<HandleLedger>,
    epoch: Instant,
    queues: Vec<Tracked>,
}

impl WgpuZone {
    pub fn open(num_queues: usize) -> Result<Self> {
        pollster::block_on(Self::open_async(num_queues))
    }

    async fn open_async(num_queues: usize) -> Result<Self> {
        let instance = wgpu::Instance::default();
        let adapter = instance
            .request_adapter(&wgpu::RequestAdapterOptions {
                power_preference: wgpu::PowerPreference::HighPerformance,
                compatible_surface: None,
                force_fallback_adapter: false,
            })
            .await
            .ok_or_else(|| Error::device_query("adapter", "no suitable GPU adapter found"))?;
        let adapter_info = adapter.get_info();
        let limits = adapter.limits();
        let (device, queue) = adapter
            .request_device(
                &wgpu::DeviceDescriptor {
                    label: Some("PredPrey Device"),
                    required_features: wgpu::Features::empty(),
                    required_limits: limits.clone(),
                    memory_hints: wgpu::MemoryHints::Performance,
                },
                None,
            )
            .await
            .map_err(|e| Error::device_query("device", e.to_string()))?;

        let lost = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&lost);
        device.on_uncaptured_error(Box::new(move |err: wgpu::Error| {
            log::error!("Uncaptured device error: {err}");
            sink.lock().get_or_insert_with(|| err.to_string());
        }));

        let max_work_group_size = limits
            .max_compute_invocations_per_workgroup
            .min(limits.max_compute_workgroup_size_x) as usize;
        let info = DeviceInfo {
            name: adapter_info.name.clone(),
            backend: format!("{:?}", adapter_info.backend),
            max_work_group_size,
        };
        log::info!(
            "Using adapter '{}' ({}), max work-group size {}",
            info.name,
            info.backend,
            max_work_group_size
        );

        let ledger = HandleLedger::new();
        let queues = (0..num_queues)
            .map(|_| Tracked::new(&ledger, HandleKind::Queue))
            .collect();
        Ok(Self {
            info,
            device: Arc::new(device),
            queue,
            max_groups_per_dispatch: limits.max_compute_workgroups_per_dimension,
            program: None,
            lost,
            ledger,
            epoch: Instant::now(),
            queues,
        })
    }

    fn device_error(&self) -> Option<String> {
        self.lost.lock().clone()
    }

    fn check_queue(&self, operation: &str, target: &str, queue: QueueId) -> Result<()> {
        if queue < self.queues.len() {
            Ok(())
        } else {
            Err(Error::enqueue(
                operation,
                target,
                format!("no queue {} (zone has {})", queue, self.queues.len()),
            ))
        }
    }

    // Wrap a submission in an event that records when the device finished it.
    fn track(&self, label: String, submission: wgpu::SubmissionIndex, queued: u64) -> WgpuEvent {
        let finished = Arc::new(AtomicU64::new(PENDING));
        let stamp = Arc::clone(&finished);
        let epoch = self.epoch;
        self.queue.on_submitted_work_done(move || {
            stamp.store(now_ns(epoch), Ordering::SeqCst);
        });
        WgpuEvent(Arc::new(EventInner {
            label,
            submission,
            queued,
            finished,
            _tracked: Tracked::new(&self.ledger, HandleKind::Event),
        }))
    }

    // Catch validation errors raised by `f` instead of letting them surface
    // through the uncaptured-error handler.
    fn scoped<T>(&self, f: impl FnOnce() -> T) -> std::result::Result<T, String> {
        self.device.push_error_scope(wgpu::ErrorFilter::Validation);
        let value = f();
        match pollster::block_on(self.device.pop_error_scope()) {
            Some(err) => Err(err.to_string()),
            None => Ok(value),
        }
    }

    fn compile(&self, signature: &KernelSignature, local_size: usize) -> Result<CompiledKernel> {
        let name = signature.name;
        let source = shader_source(name)
            .ok_or_else(|| Error::compile(name, "no WGSL source for kernel"))?;
        let text = instantiate(source, local_size);
        let entries: Vec<wgpu::BindGroupLayoutEntry> = signature
            .args
            .iter()
            .filter(|kind| !matches!(kind, ArgKind::Local))
            .enumerate()
            .map(|(binding, _)| wgpu::BindGroupLayoutEntry {
                binding: binding as u32,
                visibility: wgpu::ShaderStages::COMPUTE,
                ty: wgpu::BindingType::Buffer {
                    ty: wgpu::BufferBindingType::Storage { read_only: false },
                    has_dynamic_offset: false,
                    min_binding_size: None,
                },
                count: None,
            })
            .collect();
        self.scoped(|| {
            let module = self
                .device
                .create_shader_module(wgpu::ShaderModuleDescriptor {
                    label: Some(name),
                    source: wgpu::ShaderSource::Wgsl(text.into()),
                });
            let layout = self
                .device
                .create_bind_group_layout(&wgpu::BindGroupLayoutDescriptor {
                    label: Some(name),
                    entries: &entries,
                });
            let pipeline_layout =
                self.device
                    .create_pipeline_layout(&wgpu::PipelineLayoutDescriptor {
                        label: Some(name),
                        bind_group_layouts: &[&layout],
                        push_constant_ranges: &[],
                    });
            let pipeline = self
                .device
                .create_compute_pipeline(&wgpu::ComputePipelineDescriptor {
                    label: Some(name),
                    layout: Some(&pipeline_layout),
                    module: &module,
                    entry_point: Some(name),
                    compilation_options: Default::default(),
                    cache: None,
                });
            CompiledKernel { layout, pipeline }
        })
        .map_err(|reason| Error::compile(name, reason))
    }
}

impl ComputeZone for WgpuZone {
    type Buffer = WgpuBuffer;
    type Kernel = WgpuKernel;
    type Event = WgpuEvent;
    type Readback = WgpuReadback;

    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn num_queues(&self) -> usize {
        self.queues.len()
    }

    fn build_program(&mut self, options: &ProgramOptions) -> Result<()> {
        let local_size = options.local_size;
        if local_size == 0 || local_size > self.info.max_work_group_size {
            return Err(Error::compile(
                "program",
                format!(
                    "local size {} outside 1..={}",
                    local_size, self.info.max_work_group_size
                ),
            ));
        }
        let mut compiled = HashMap::new();
        for signature in kernels::PROGRAM.iter() {
            let kernel = self.compile(signature, local_size)?;
            compiled.insert(signature.name, Arc::new(kernel));
        }
        log::debug!("Compiled {} kernels with local size {}", compiled.len(), local_size);
        self.program = Some(WgpuProgram {
            local_size,
            kernels: compiled,
        });
        Ok(())
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<WgpuBuffer> {
        if desc.size == 0 {
            return Err(Error::allocation(desc.label, "buffer size must be non-zero"));
        }
        // Storage bindings and copies work in whole words
        let padded = desc.size.div_ceil(4) * 4;
        // Access is checked at bind time; the shaders declare every binding
        // read-write storage
        let usage = wgpu::BufferUsages::STORAGE
            | wgpu::BufferUsages::COPY_DST
            | wgpu::BufferUsages::COPY_SRC;
        let buffer = self
            .scoped(|| {
                self.device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some(desc.label),
                    size: padded as wgpu::BufferAddress,
                    usage,
                    mapped_at_creation: false,
                })
            })
            .map_err(|reason| Error::allocation(desc.label, reason))?;
        Ok(WgpuBuffer(Arc::new(BufferInner {
            buffer,
            label: desc.label,
            size: desc.size,
            access: desc.access,
            _tracked: Tracked::new(&self.ledger, HandleKind::Buffer),
        })))
    }

    fn create_kernel(&self, name: &str) -> Result<WgpuKernel> {
        let program = self
            .program
            .as_ref()
            .ok_or_else(|| Error::compile(name, "program has not been built"))?;
        let (Some(signature), Some(compiled)) =
            (kernels::signature(name), program.kernels.get(name))
        else {
            return Err(Error::compile(name, "no such kernel entry point"));
        };
        Ok(WgpuKernel {
            signature,
            compiled: Arc::clone(compiled),
            args: (0..signature.args.len()).map(|_| None).collect(),
            _tracked: Tracked::new(&self.ledger, HandleKind::Kernel),
        })
    }

    fn set_arg(
        &self,
        kernel: &mut WgpuKernel,
        index: u32,
        arg: KernelArg<'_, WgpuBuffer>,
    ) -> Result<()> {
        check_arg(kernel.signature, index, &arg)?;
        let name = kernel.signature.name;
        let bound = match arg {
            KernelArg::Buffer(buffer) => {
                check_access(kernel.signature, index, buffer.label(), buffer.access())?;
                WgpuArg::Buffer(buffer.clone())
            }
            KernelArg::Local(bytes) => {
                // Local scratch is sized in the shader text at build time
                let expected = self
                    .program
                    .as_ref()
                    .map(|p| p.local_size * std::mem::size_of::<u32>())
                    .unwrap_or(0);
                if bytes != expected {
                    return Err(Error::bind(
                        name,
                        index,
                        format!("local scratch is {bytes} bytes, program was built for {expected}"),
                    ));
                }
                WgpuArg::Local
            }
            KernelArg::Scalar(bytes) => {
                let buffer = self
                    .device
                    .create_buffer_init(&wgpu::util::BufferInitDescriptor {
                        label: Some(name),
                        contents: bytes,
                        usage: wgpu::BufferUsages::STORAGE | wgpu::BufferUsages::COPY_DST,
                    });
                WgpuArg::Scalar(buffer)
            }
        };
        kernel.args[index as usize] = Some(bound);
        Ok(())
    }

    fn enqueue_write(
        &self,
        queue: QueueId,
        buffer: &WgpuBuffer,
        offset: usize,
        data: &[u8],
        _wait: &[WgpuEvent],
    ) -> Result<WgpuEvent> {
        let target = buffer.label();
        self.check_queue("write", target, queue)?;
        if offset % 4 != 0 || data.len() % 4 != 0 || offset + data.len() > buffer.0.size {
            return Err(Error::enqueue(
                "write",
                target,
                format!(
                    "range {}..{} is unaligned or outside buffer of {} bytes",
                    offset,
                    offset + data.len(),
                    buffer.0.size
                ),
            ));
        }
        let queued = now_ns(self.epoch);
        let submission = self
            .scoped(|| {
                self.queue
                    .write_buffer(&buffer.0.buffer, offset as wgpu::BufferAddress, data);
                self.queue.submit(std::iter::empty())
            })
            .map_err(|reason| Error::enqueue("write", target, reason))?;
        Ok(self.track(format!("write '{target}'"), submission, queued))
    }

    fn enqueue_kernel(
        &self,
        queue: QueueId,
        kernel: &WgpuKernel,
        range: NdRange,
        _wait: &[WgpuEvent],
    ) -> Result<WgpuEvent> {
        let name = kernel.signature.name;
        self.check_queue("kernel launch", name, queue)?;
        check_range(name, range, self.info.max_work_group_size)?;
        let local_size = self.program.as_ref().map(|p| p.local_size).unwrap_or(0);
        let groups = range.groups();
        if range.local != local_size || groups > self.max_groups_per_dispatch as usize {
            return Err(Error::enqueue(
                "kernel launch",
                name,
                format!(
                    "{} groups of {} do not fit a program built for groups of {}",
                    groups, range.local, local_size
                ),
            ));
        }

        let mut entries = Vec::new();
        for (index, arg) in kernel.args.iter().enumerate() {
            let resource = match arg {
                None => {
                    return Err(Error::enqueue(
                        "kernel launch",
                        name,
                        format!("argument {index} is not set"),
                    ));
                }
                Some(WgpuArg::Local) => continue,
                Some(WgpuArg::Buffer(buffer)) => buffer.0.buffer.as_entire_binding(),
                Some(WgpuArg::Scalar(buffer)) => buffer.as_entire_binding(),
            };
            entries.push(wgpu::BindGroupEntry {
                binding: entries.len() as u32,
                resource,
            });
        }

        let queued = now_ns(self.epoch);
        let submission = self
            .scoped(|| {
                let bind_group = self.device.create_bind_group(&wgpu::BindGroupDescriptor {
                    label: Some(name),
                    layout: &kernel.compiled.layout,
                    entries: &entries,
                });
                let mut encoder = self
                    .device
                    .create_command_encoder(&wgpu::CommandEncoderDescriptor { label: Some(name) });
                {
                    let mut pass = encoder.begin_compute_pass(&wgpu::ComputePassDescriptor {
                        label: Some(name),
                        timestamp_writes: None,
                    });
                    pass.set_pipeline(&kernel.compiled.pipeline);
                    pass.set_bind_group(0, &bind_group, &[]);
                    pass.dispatch_workgroups(groups as u32, 1, 1);
                }
                self.queue.submit(Some(encoder.finish()))
            })
            .map_err(|reason| Error::enqueue("kernel launch", name, reason))?;
        Ok(self.track(format!("kernel launch '{name}'"), submission, queued))
    }

    fn enqueue_read(
        &self,
        queue: QueueId,
        buffer: &WgpuBuffer,
        offset: usize,
        len: usize,
        _wait: &[WgpuEvent],
    ) -> Result<(WgpuEvent, WgpuReadback)> {
        let target = buffer.label();
        self.check_queue("read", target, queue)?;
        if offset % 4 != 0 || len % 4 != 0 || len == 0 || offset + len > buffer.0.size {
            return Err(Error::enqueue(
                "read",
                target,
                format!("range {}..{} is unaligned or out of bounds", offset, offset + len),
            ));
        }
        let queued = now_ns(self.epoch);
        let (staging, submission) = self
            .scoped(|| {
                let staging = self.device.create_buffer(&wgpu::BufferDescriptor {
                    label: Some("read-back staging"),
                    size: len as wgpu::BufferAddress,
                    usage: wgpu::BufferUsages::MAP_READ | wgpu::BufferUsages::COPY_DST,
                    mapped_at_creation: false,
                });
                let mut encoder = self
                    .device
                    .create_command_encoder(&wgpu::CommandEncoderDescriptor {
                        label: Some("read-back"),
                    });
                encoder.copy_buffer_to_buffer(
                    &buffer.0.buffer,
                    offset as wgpu::BufferAddress,
                    &staging,
                    0,
                    len as wgpu::BufferAddress,
                );
                let submission = self.queue.submit(Some(encoder.finish()));
                (staging, submission)
            })
            .map_err(|reason| Error::enqueue("read", target, reason))?;

        let state: MapState = Arc::new(Mutex::new(None));
        let sink = Arc::clone(&state);
        staging
            .slice(..)
            .map_async(wgpu::MapMode::Read, move |result| {
                *sink.lock() = Some(result);
            });
        let event = self.track(format!("read '{target}'"), submission, queued);
        let readback = WgpuReadback {
            device: Arc::clone(&self.device),
            staging: Some(staging),
            len,
            state,
        };
        Ok((event, readback))
    }

    fn wait(&self, events: &[WgpuEvent]) -> Result<()> {
        for event in events {
            self.device.poll(wgpu::Maintain::WaitForSubmissionIndex(
                event.0.submission.clone(),
            ));
            if let Some(reason) = self.device_error() {
                return Err(Error::sync(event.0.label.clone(), reason));
            }
        }
        Ok(())
    }

    fn finish(&self, queue: QueueId) -> Result<()> {
        let target = format!("queue {queue}");
        if queue >= self.queues.len() {
            return Err(Error::sync(target, "no such queue"));
        }
        self.device.poll(wgpu::Maintain::Wait);
        match self.device_error() {
            Some(reason) => Err(Error::sync(target, reason)),
            None => Ok(()),
        }
    }

    // Start is the submission time; end is when the device reported the
    // submission done, observed at the next poll.
    fn event_times(&self, event: &WgpuEvent) -> Option<EventTimes> {
        let end = event.0.finished.load(Ordering::SeqCst);
        (end != PENDING).then(|| EventTimes {
            queued: event.0.queued,
            start: event.0.queued,
            end,
        })
    }

    fn ledger(&self) -> Arc<HandleLedger> {
        Arc::clone(&self.ledger)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn instantiate_fills_every_placeholder() {
        for name in ["grass", "reduce_grass1", "reduce_grass2"] {
            let text = instantiate(shader_source(name).unwrap(), 96);
            assert!(!text.contains("{{"), "{name} still has placeholders");
        }
        let text = instantiate(REDUCE_GRASS2_SHADER, 96);
        assert!(text.contains("@workgroup_size(96)"));
        assert!(text.contains("128u / 2u"));
        assert!(text.contains("stats[2u]"));
    }

    #[test]
    fn every_program_kernel_has_a_shader() {
        for sig in kernels::PROGRAM.iter() {
            let source = shader_source(sig.name).unwrap();
            assert!(source.contains(&format!("fn {}(", sig.name)));
        }
    }
}
// --- End of File: wgpu_zone.rs ---
