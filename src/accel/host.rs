// --- File: host.rs ---
// Software compute zone. Each queue is a worker thread draining an in-order
// command channel; ordering across queues exists only through events.
use super::host_kernels::{self, KernelFn};
use super::ledger::{HandleCounts, HandleKind, HandleLedger, Tracked};
use super::{
    BufferDesc, ComputeZone, DeviceInfo, EventTimes, KernelArg, MemAccess, NdRange, PendingRead,
    ProgramOptions, QueueId, check_access, check_arg, check_range,
};
use crate::constants::{HOST_DEFAULT_MAX_WORK_GROUP, HOST_DEFAULT_QUEUES, TRANSFER_QUEUE};
use crate::error::{Error, Result};
use crate::kernels::{self, KernelSignature};
use std::collections::HashMap;
use std::panic::{self, AssertUnwindSafe};
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::sync::Arc;
use std::sync::mpsc::{self, Receiver, Sender};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

fn now_ns(epoch: Instant) -> u64 {
    epoch.elapsed().as_nanos() as u64
}

// --- Builder ---

#[derive(Debug, Clone, Default)]
struct FaultPlan {
    fail_build: bool,
    fail_allocation: Option<String>,
    fail_launch: Option<(String, usize)>,
    fail_execution: Option<(String, usize)>,
}

#[derive(Debug, Clone)]
pub struct HostZoneBuilder {
    max_work_group_size: usize,
    queues: usize,
    transfer_delay: Option<Duration>,
    faults: FaultPlan,
}

impl Default for HostZoneBuilder {
    fn default() -> Self {
        Self {
            max_work_group_size: HOST_DEFAULT_MAX_WORK_GROUP,
            queues: HOST_DEFAULT_QUEUES,
            transfer_delay: None,
            faults: FaultPlan::default(),
        }
    }
}

impl HostZoneBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Reported maximum work-group size. Zero is accepted so callers can
    /// exercise their handling of a degenerate device.
    pub fn max_work_group_size(mut self, size: usize) -> Self {
        self.max_work_group_size = size;
        self
    }

    pub fn queues(mut self, count: usize) -> Self {
        self.queues = count;
        self
    }

    /// Stall every transfer-queue command for `delay` once its dependencies
    /// have resolved, so compute work overtakes host transfers.
    pub fn transfer_delay(mut self, delay: Duration) -> Self {
        self.transfer_delay = Some(delay);
        self
    }

    // Make the next program build fail.
    pub fn fail_build(mut self) -> Self {
        self.faults.fail_build = true;
        self
    }

    // Make creation of the buffer with this label fail.
    pub fn fail_allocation(mut self, label: &str) -> Self {
        self.faults.fail_allocation = Some(label.to_string());
        self
    }

    // Reject the `nth` launch (1-based) of `kernel` at enqueue time.
    pub fn fail_launch(mut self, kernel: &str, nth: usize) -> Self {
        self.faults.fail_launch = Some((kernel.to_string(), nth));
        self
    }

    // Accept the `nth` launch of `kernel` but fail it on the device, so the
    // error surfaces through its event.
    pub fn fail_execution(mut self, kernel: &str, nth: usize) -> Self {
        self.faults.fail_execution = Some((kernel.to_string(), nth));
        self
    }

    pub fn build(self) -> Result<HostZone> {
        let ledger = HandleLedger::new();
        let epoch = Instant::now();
        let queues = (0..self.queues)
            .map(|id| {
                let delay = self.transfer_delay.filter(|_| id == TRANSFER_QUEUE);
                HostQueue::spawn(id, epoch, delay, &ledger)
            })
            .collect::<Result<Vec<_>>>()?;
        let info = DeviceInfo {
            name: "host".to_string(),
            backend: format!("host ({} rayon threads)", rayon::current_num_threads()),
            max_work_group_size: self.max_work_group_size,
        };
        log::debug!(
            "Host zone ready: {} queue(s), max work-group size {}",
            queues.len(),
            info.max_work_group_size
        );
        Ok(HostZone {
            info,
            queues,
            ledger,
            epoch,
            program: None,
            faults: self.faults,
            launches: Mutex::new(HashMap::new()),
        })
    }
}

// --- Handles ---

pub(super) type BufferGuard<'a> = MutexGuard<'a, Vec<u32>>;

#[derive(Debug)]
struct BufferInner {
    label: &'static str,
    size: usize,
    access: MemAccess,
    words: Mutex<Vec<u32>>, // Word storage keeps u32 views aligned
    _tracked: Tracked,
}

#[derive(Debug, Clone)]
pub struct HostBuffer(Arc<BufferInner>);

impl HostBuffer {
    pub fn label(&self) -> &'static str {
        self.0.label
    }

    pub fn size(&self) -> usize {
        self.0.size
    }

    pub fn access(&self) -> MemAccess {
        self.0.access
    }

    pub(super) fn lock(&self) -> BufferGuard<'_> {
        self.0.words.lock()
    }

    pub(super) fn same_as(&self, other: &HostBuffer) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
    }

    pub(super) fn addr(&self) -> usize {
        Arc::as_ptr(&self.0) as usize
    }

    fn check_span(&self, operation: &str, offset: usize, len: usize) -> Result<()> {
        match offset.checked_add(len) {
            Some(end) if end <= self.0.size => Ok(()),
            _ => Err(Error::enqueue(
                operation,
                self.0.label,
                format!(
                    "range {}..{} outside buffer of {} bytes",
                    offset,
                    offset.saturating_add(len),
                    self.0.size
                ),
            )),
        }
    }
}

#[derive(Debug, Clone)]
pub(super) enum BoundArg {
    Buffer(HostBuffer),
    Local(usize),
    Scalar(Vec<u8>),
}

#[derive(Debug)]
pub struct HostKernel {
    signature: &'static KernelSignature,
    run: KernelFn,
    args: Vec<Option<BoundArg>>,
    _tracked: Tracked,
}

impl HostKernel {
    pub fn name(&self) -> &'static str {
        self.signature.name
    }
}

#[derive(Debug, Clone)]
enum Status {
    Pending,
    Complete,
    Failed(String),
}

#[derive(Debug)]
struct EventState {
    status: Status,
    times: EventTimes,
}

#[derive(Debug)]
struct EventInner {
    label: String,
    state: Mutex<EventState>,
    done: Condvar,
    _tracked: Tracked,
}

// Completion event. Clones share one underlying event.
#[derive(Debug, Clone)]
pub struct HostEvent(Arc<EventInner>);

impl HostEvent {
    fn new(ledger: &Arc<HandleLedger>, label: String, queued: u64) -> Self {
        HostEvent(Arc::new(EventInner {
            label,
            state: Mutex::new(EventState {
                status: Status::Pending,
                times: EventTimes {
                    queued,
                    start: queued,
                    end: queued,
                },
            }),
            done: Condvar::new(),
            _tracked: Tracked::new(ledger, HandleKind::Event),
        }))
    }

    pub fn label(&self) -> &str {
        &self.0.label
    }

    fn state(&self) -> MutexGuard<'_, EventState> {
        self.0.state.lock()
    }

    fn mark_started(&self, ns: u64) {
        self.state().times.start = ns;
    }

    fn settle(&self, ns: u64, outcome: std::result::Result<(), String>) {
        let mut state = self.state();
        state.times.end = ns;
        state.status = match outcome {
            Ok(()) => Status::Complete,
            Err(reason) => Status::Failed(reason),
        };
        drop(state);
        self.0.done.notify_all();
    }

    fn block(&self) -> std::result::Result<(), String> {
        let mut state = self.state();
        while matches!(state.status, Status::Pending) {
            self.0.done.wait(&mut state);
        }
        match &state.status {
            Status::Failed(reason) => Err(reason.clone()),
            _ => Ok(()),
        }
    }

    pub fn is_complete(&self) -> bool {
        matches!(self.state().status, Status::Complete)
    }

    fn times(&self) -> Option<EventTimes> {
        let state = self.state();
        match state.status {
            Status::Complete => Some(state.times),
            _ => None,
        }
    }
}

type ReadSlot = Arc<Mutex<Option<Vec<u8>>>>;

#[derive(Debug)]
pub struct HostReadback {
    slot: ReadSlot,
}

impl PendingRead for HostReadback {
    fn try_take(&mut self) -> Result<Option<Vec<u8>>> {
        Ok(self.slot.lock().take())
    }
}

// --- Queue Workers ---

struct KernelLaunch {
    name: &'static str,
    run: KernelFn,
    range: NdRange,
    args: Vec<BoundArg>, // Snapshot taken at enqueue time
    inject_failure: bool,
}

enum Op {
    Write {
        buffer: HostBuffer,
        offset: usize,
        data: Vec<u8>,
    },
    Read {
        buffer: HostBuffer,
        offset: usize,
        len: usize,
        slot: ReadSlot,
    },
    Kernel(KernelLaunch),
    Marker,
}

impl Op {
    fn execute(self) -> std::result::Result<(), String> {
        match self {
            Op::Write {
                buffer,
                offset,
                data,
            } => {
                let mut words = buffer.lock();
                let bytes: &mut [u8] = bytemuck::cast_slice_mut(words.as_mut_slice());
                bytes[offset..offset + data.len()].copy_from_slice(&data);
                Ok(())
            }
            Op::Read {
                buffer,
                offset,
                len,
                slot,
            } => {
                let words = buffer.lock();
                let bytes: &[u8] = bytemuck::cast_slice(words.as_slice());
                let copy = bytes[offset..offset + len].to_vec();
                *slot.lock() = Some(copy);
                Ok(())
            }
            Op::Kernel(launch) => {
                if launch.inject_failure {
                    return Err(format!("injected execution failure in '{}'", launch.name));
                }
                let KernelLaunch {
                    name,
                    run,
                    range,
                    args,
                    ..
                } = launch;
                panic::catch_unwind(AssertUnwindSafe(|| run(range, &args)))
                    .unwrap_or_else(|_| Err(format!("kernel '{name}' panicked")))
            }
            Op::Marker => Ok(()),
        }
    }
}

struct Command {
    op: Op,
    wait: Vec<HostEvent>,
    event: HostEvent,
}

fn worker_loop(commands: Receiver<Command>, epoch: Instant, delay: Option<Duration>) {
    for Command { op, wait, event } in commands {
        let blocked = wait.iter().find_map(|dep| {
            dep.block()
                .err()
                .map(|reason| format!("dependency '{}' failed: {}", dep.label(), reason))
        });
        drop(wait);
        if let Some(reason) = blocked {
            event.settle(now_ns(epoch), Err(reason));
            continue;
        }
        if let Some(delay) = delay {
            thread::sleep(delay);
        }
        event.mark_started(now_ns(epoch));
        let outcome = op.execute();
        event.settle(now_ns(epoch), outcome);
    }
}

struct HostQueue {
    id: QueueId,
    sender: Option<Sender<Command>>,
    worker: Option<JoinHandle<()>>,
    _tracked: Tracked,
}

impl HostQueue {
    fn spawn(
        id: QueueId,
        epoch: Instant,
        delay: Option<Duration>,
        ledger: &Arc<HandleLedger>,
    ) -> Result<Self> {
        let (sender, commands) = mpsc::channel();
        let worker = thread::Builder::new()
            .name(format!("host-queue-{id}"))
            .spawn(move || worker_loop(commands, epoch, delay))
            .map_err(|e| Error::device_query(format!("queue {id}"), e.to_string()))?;
        Ok(Self {
            id,
            sender: Some(sender),
            worker: Some(worker),
            _tracked: Tracked::new(ledger, HandleKind::Queue),
        })
    }

    fn submit(&self, command: Command) -> std::result::Result<(), String> {
        match &self.sender {
            Some(sender) => sender
                .send(command)
                .map_err(|_| format!("queue {} worker has shut down", self.id)),
            None => Err(format!("queue {} is closed", self.id)),
        }
    }
}

impl Drop for HostQueue {
    fn drop(&mut self) {
        // Closing the channel lets the worker drain what is left and exit
        self.sender.take();
        if let Some(worker) = self.worker.take() {
            if worker.join().is_err() {
                log::error!("Host queue {} worker panicked", self.id);
            }
        }
    }
}

// --- Zone ---

pub struct HostZone {
    info: DeviceInfo,
    queues: Vec<HostQueue>,
    ledger: Arc<HandleLedger>,
    epoch: Instant,
    program: Option<ProgramOptions>,
    faults: FaultPlan,
    launches: Mutex<HashMap<&'static str, usize>>,
}

impl HostZone {
    pub fn builder() -> HostZoneBuilder {
        HostZoneBuilder::new()
    }

    fn queue(&self, operation: &str, target: &str, queue: QueueId) -> Result<&HostQueue> {
        self.queues.get(queue).ok_or_else(|| {
            Error::enqueue(
                operation,
                target,
                format!("no queue {} (zone has {})", queue, self.queues.len()),
            )
        })
    }

    fn submit(
        &self,
        queue: &HostQueue,
        operation: &str,
        target: &str,
        op: Op,
        wait: &[HostEvent],
    ) -> Result<HostEvent> {
        let event = HostEvent::new(
            &self.ledger,
            format!("{operation} '{target}'"),
            now_ns(self.epoch),
        );
        let command = Command {
            op,
            wait: wait.to_vec(),
            event: event.clone(),
        };
        queue
            .submit(command)
            .map_err(|reason| Error::enqueue(operation, target, reason))?;
        Ok(event)
    }

    // Count this launch and report which injected fault, if any, it hits.
    fn count_launch(&self, name: &'static str) -> (bool, bool) {
        let mut launches = self.launches.lock();
        let count = launches.entry(name).or_insert(0);
        *count += 1;
        let hits = |fault: &Option<(String, usize)>| {
            matches!(fault, Some((kernel, nth)) if kernel == name && *nth == *count)
        };
        (hits(&self.faults.fail_launch), hits(&self.faults.fail_execution))
    }
}

impl ComputeZone for HostZone {
    type Buffer = HostBuffer;
    type Kernel = HostKernel;
    type Event = HostEvent;
    type Readback = HostReadback;

    fn info(&self) -> &DeviceInfo {
        &self.info
    }

    fn num_queues(&self) -> usize {
        self.queues.len()
    }

    fn build_program(&mut self, options: &ProgramOptions) -> Result<()> {
        if self.faults.fail_build {
            return Err(Error::compile("program", "injected build failure"));
        }
        if options.local_size == 0 || options.local_size > self.info.max_work_group_size {
            return Err(Error::compile(
                "program",
                format!(
                    "local size {} outside 1..={}",
                    options.local_size, self.info.max_work_group_size
                ),
            ));
        }
        if let Some(missing) = kernels::PROGRAM
            .iter()
            .find(|sig| host_kernels::lookup(sig.name).is_none())
        {
            return Err(Error::compile(missing.name, "no host implementation"));
        }
        log::debug!("Host program built with local size {}", options.local_size);
        self.program = Some(*options);
        Ok(())
    }

    fn create_buffer(&self, desc: &BufferDesc) -> Result<HostBuffer> {
        if desc.size == 0 {
            return Err(Error::allocation(desc.label, "buffer size must be non-zero"));
        }
        if self.faults.fail_allocation.as_deref() == Some(desc.label) {
            return Err(Error::allocation(desc.label, "injected allocation failure"));
        }
        let word_count = desc.size.div_ceil(std::mem::size_of::<u32>());
        let mut words = Vec::new();
        words
            .try_reserve_exact(word_count)
            .map_err(|e| Error::allocation(desc.label, e.to_string()))?;
        words.resize(word_count, 0u32);
        Ok(HostBuffer(Arc::new(BufferInner {
            label: desc.label,
            size: desc.size,
            access: desc.access,
            words: Mutex::new(words),
            _tracked: Tracked::new(&self.ledger, HandleKind::Buffer),
        })))
    }

    fn create_kernel(&self, name: &str) -> Result<HostKernel> {
        if self.program.is_none() {
            return Err(Error::compile(name, "program has not been built"));
        }
        let (Some(signature), Some(run)) = (kernels::signature(name), host_kernels::lookup(name))
        else {
            return Err(Error::compile(name, "no such kernel entry point"));
        };
        Ok(HostKernel {
            signature,
            run,
            args: vec![None; signature.args.len()],
            _tracked: Tracked::new(&self.ledger, HandleKind::Kernel),
        })
    }

    fn set_arg(
        &self,
        kernel: &mut HostKernel,
        index: u32,
        arg: KernelArg<'_, HostBuffer>,
    ) -> Result<()> {
        check_arg(kernel.signature, index, &arg)?;
        let bound = match arg {
            KernelArg::Buffer(buffer) => {
                check_access(kernel.signature, index, buffer.label(), buffer.access())?;
                BoundArg::Buffer(buffer.clone())
            }
            KernelArg::Local(bytes) => BoundArg::Local(bytes),
            KernelArg::Scalar(bytes) => BoundArg::Scalar(bytes.to_vec()),
        };
        kernel.args[index as usize] = Some(bound);
        Ok(())
    }

    fn enqueue_write(
        &self,
        queue: QueueId,
        buffer: &HostBuffer,
        offset: usize,
        data: &[u8],
        wait: &[HostEvent],
    ) -> Result<HostEvent> {
        let target = buffer.label();
        let queue = self.queue("write", target, queue)?;
        buffer.check_span("write", offset, data.len())?;
        let op = Op::Write {
            buffer: buffer.clone(),
            offset,
            data: data.to_vec(),
        };
        self.submit(queue, "write", target, op, wait)
    }

    fn enqueue_kernel(
        &self,
        queue: QueueId,
        kernel: &HostKernel,
        range: NdRange,
        wait: &[HostEvent],
    ) -> Result<HostEvent> {
        let name = kernel.name();
        let queue = self.queue("kernel launch", name, queue)?;
        check_range(name, range, self.info.max_work_group_size)?;
        let args = kernel
            .args
            .iter()
            .enumerate()
            .map(|(i, arg)| {
                arg.clone().ok_or_else(|| {
                    Error::enqueue("kernel launch", name, format!("argument {i} is not set"))
                })
            })
            .collect::<Result<Vec<_>>>()?;
        let (reject, inject_failure) = self.count_launch(name);
        if reject {
            return Err(Error::enqueue(
                "kernel launch",
                name,
                "injected launch failure",
            ));
        }
        let op = Op::Kernel(KernelLaunch {
            name,
            run: kernel.run,
            range,
            args,
            inject_failure,
        });
        self.submit(queue, "kernel launch", name, op, wait)
    }

    fn enqueue_read(
        &self,
        queue: QueueId,
        buffer: &HostBuffer,
        offset: usize,
        len: usize,
        wait: &[HostEvent],
    ) -> Result<(HostEvent, HostReadback)> {
        let target = buffer.label();
        let queue = self.queue("read", target, queue)?;
        buffer.check_span("read", offset, len)?;
        let slot: ReadSlot = Arc::new(Mutex::new(None));
        let op = Op::Read {
            buffer: buffer.clone(),
            offset,
            len,
            slot: Arc::clone(&slot),
        };
        let event = self.submit(queue, "read", target, op, wait)?;
        Ok((event, HostReadback { slot }))
    }

    fn wait(&self, events: &[HostEvent]) -> Result<()> {
        for event in events {
            event
                .block()
                .map_err(|reason| Error::sync(event.label(), reason))?;
        }
        Ok(())
    }

    fn finish(&self, queue: QueueId) -> Result<()> {
        let target = format!("queue {queue}");
        let handle = self
            .queues
            .get(queue)
            .ok_or_else(|| Error::sync(&target, "no such queue"))?;
        let marker = self
            .submit(handle, "finish", &target, Op::Marker, &[])
            .map_err(|e| Error::sync(&target, e.to_string()))?;
        marker.block().map_err(|reason| Error::sync(&target, reason))
    }

    fn event_times(&self, event: &HostEvent) -> Option<EventTimes> {
        event.times()
    }

    fn ledger(&self) -> Arc<HandleLedger> {
        Arc::clone(&self.ledger)
    }

    fn live_handles(&self) -> HandleCounts {
        self.ledger.snapshot()
    }
}

// --- End of File: host.rs ---
