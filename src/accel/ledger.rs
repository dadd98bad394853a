// --- File: ledger.rs ---
// Outstanding-handle bookkeeping. Every queue, buffer, kernel and event a zone
// hands out carries a `Tracked` guard; dropping the handle releases it once.
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub enum HandleKind {
    Queue,
    Buffer,
    Kernel,
    Event,
}

#[derive(Debug, Copy, Clone, Default, PartialEq, Eq)]
pub struct HandleCounts {
    pub queues: usize,
    pub buffers: usize,
    pub kernels: usize,
    pub events: usize,
}

impl HandleCounts {
    // True when no run-scoped handle (buffer, kernel, event) is left alive.
    pub fn run_scoped_clear(&self) -> bool {
        self.buffers == 0 && self.kernels == 0 && self.events == 0
    }

    pub fn all_clear(&self) -> bool {
        self.run_scoped_clear() && self.queues == 0
    }
}

#[derive(Debug, Default)]
pub struct HandleLedger {
    queues: AtomicUsize,
    buffers: AtomicUsize,
    kernels: AtomicUsize,
    events: AtomicUsize,
    released_total: AtomicUsize,
}

impl HandleLedger {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    fn counter(&self, kind: HandleKind) -> &AtomicUsize {
        match kind {
            HandleKind::Queue => &self.queues,
            HandleKind::Buffer => &self.buffers,
            HandleKind::Kernel => &self.kernels,
            HandleKind::Event => &self.events,
        }
    }

    fn acquire(&self, kind: HandleKind) {
        self.counter(kind).fetch_add(1, Ordering::SeqCst);
    }

    fn release(&self, kind: HandleKind) {
        let previous = self.counter(kind).fetch_sub(1, Ordering::SeqCst);
        debug_assert!(previous > 0, "{kind:?} released more often than acquired");
        self.released_total.fetch_add(1, Ordering::SeqCst);
    }

    pub fn snapshot(&self) -> HandleCounts {
        HandleCounts {
            queues: self.queues.load(Ordering::SeqCst),
            buffers: self.buffers.load(Ordering::SeqCst),
            kernels: self.kernels.load(Ordering::SeqCst),
            events: self.events.load(Ordering::SeqCst),
        }
    }

    // Number of releases performed so far, across all kinds.
    pub fn released_total(&self) -> usize {
        self.released_total.load(Ordering::SeqCst)
    }
}

// Scope guard for one acquired handle.
#[derive(Debug)]
pub struct Tracked {
    ledger: Arc<HandleLedger>,
    kind: HandleKind,
}

impl Tracked {
    pub fn new(ledger: &Arc<HandleLedger>, kind: HandleKind) -> Self {
        ledger.acquire(kind);
        Self {
            ledger: Arc::clone(ledger),
            kind,
        }
    }
}

impl Drop for Tracked {
    fn drop(&mut self) {
        self.ledger.release(self.kind);
    }
}

// --- End of File: ledger.rs ---
