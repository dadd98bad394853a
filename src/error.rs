// --- File: error.rs ---
// Every accelerator call is checked as soon as it returns. No retries.
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("device query failed ({query}): {reason}")]
    DeviceQuery { query: String, reason: String },

    #[error("allocation of buffer '{buffer}' failed: {reason}")]
    Allocation { buffer: String, reason: String },

    // Also covers a missing kernel entry point
    #[error("kernel compile failed for '{kernel}': {reason}")]
    Compile { kernel: String, reason: String },

    #[error("binding arg {index} of kernel '{kernel}' failed: {reason}")]
    ArgumentBind {
        kernel: String,
        index: u32,
        reason: String,
    },

    #[error("enqueue of {operation} on '{target}' failed{}: {reason}", iteration_suffix(.iteration))]
    Enqueue {
        operation: String,
        target: String,
        iteration: Option<u32>,
        reason: String,
    },

    #[error("synchronization failed while waiting on {target}{}: {reason}", iteration_suffix(.iteration))]
    Sync {
        target: String,
        iteration: Option<u32>,
        reason: String,
    },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, Error>;

fn iteration_suffix(iteration: &Option<u32>) -> String {
    match iteration {
        Some(i) => format!(" (iteration {i})"),
        None => String::new(),
    }
}

impl Error {
    pub fn device_query(query: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::DeviceQuery {
            query: query.into(),
            reason: reason.into(),
        }
    }

    pub fn allocation(buffer: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Allocation {
            buffer: buffer.into(),
            reason: reason.into(),
        }
    }

    pub fn compile(kernel: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Compile {
            kernel: kernel.into(),
            reason: reason.into(),
        }
    }

    pub fn bind(kernel: impl Into<String>, index: u32, reason: impl Into<String>) -> Self {
        Error::ArgumentBind {
            kernel: kernel.into(),
            index,
            reason: reason.into(),
        }
    }

    pub fn enqueue(
        operation: impl Into<String>,
        target: impl Into<String>,
        reason: impl Into<String>,
    ) -> Self {
        Error::Enqueue {
            operation: operation.into(),
            target: target.into(),
            iteration: None,
            reason: reason.into(),
        }
    }

    pub fn sync(target: impl Into<String>, reason: impl Into<String>) -> Self {
        Error::Sync {
            target: target.into(),
            iteration: None,
            reason: reason.into(),
        }
    }

    pub fn io(path: impl Into<String>, source: std::io::Error) -> Self {
        Error::Io {
            path: path.into(),
            source,
        }
    }

    // Only enqueue and sync failures happen inside the loop
    pub fn at_iteration(self, iter: u32) -> Self {
        match self {
            Error::Enqueue {
                operation,
                target,
                reason,
                ..
            } => Error::Enqueue {
                operation,
                target,
                iteration: Some(iter),
                reason,
            },
            Error::Sync { target, reason, .. } => Error::Sync {
                target,
                iteration: Some(iter),
                reason,
            },
            other => other,
        }
    }

    pub fn iteration(&self) -> Option<u32> {
        match self {
            Error::Enqueue { iteration, .. } | Error::Sync { iteration, .. } => *iteration,
            _ => None,
        }
    }
}

// --- End of File: error.rs ---
