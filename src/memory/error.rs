use super::vm::VmError;
use crate::sync::atomic::{AtomicUsize, Ordering};

#[derive(Debug, thiserror::Error)]
pub enum AllocError {
    #[error("out of memory allocating {size} bytes aligned to {align}")]
    OutOfMemory {
        size: usize,
        align: usize,
        #[source]
        source: Option<VmError>,
    },
    #[error("alignment {0} is not a power of two")]
    InvalidAlignment(usize),
    #[error("pointer {0:#x} was not allocated by this allocator")]
    UnknownPointer(usize),
    #[error("OS allocation descriptor at {0:#x} is corrupt (double free or overrun?)")]
    CorruptDescriptor(usize),
    #[error("realloc is not supported by {0}")]
    ReallocUnsupported(&'static str),
    #[error("invalid allocator configuration: {0}")]
    InvalidConfig(String),
    #[error(transparent)]
    Vm(#[from] VmError),
}

impl AllocError {
    pub(crate) fn oom(size: usize, align: usize, source: VmError) -> Self {
        Self::OutOfMemory {
            size,
            align,
            source: Some(source),
        }
    }

    pub(crate) fn exhausted(size: usize, align: usize) -> Self {
        Self::OutOfMemory {
            size,
            align,
            source: None,
        }
    }

    /// Out-of-memory conditions are fatal in production; the rest are
    /// contract violations.
    pub fn is_out_of_memory(&self) -> bool {
        matches!(self, Self::OutOfMemory { .. } | Self::Vm(_))
    }
}

/// Called with the failing size and alignment. Must not return.
pub type OutOfMemoryHandler = fn(size: usize, align: usize) -> !;

// Stored as usize so the static stays const-constructible under loom too.
crate::sync::static_atomic! {
    static OOM_HANDLER: AtomicUsize = AtomicUsize::new(0);
}

/// Install the process-wide out-of-memory handler.
pub fn set_out_of_memory_handler(handler: OutOfMemoryHandler) {
    OOM_HANDLER.store(handler as usize, Ordering::Release);
}

fn default_out_of_memory(size: usize, align: usize) -> ! {
    let layout = std::alloc::Layout::from_size_align(size, align)
        .unwrap_or_else(|_| std::alloc::Layout::new::<u8>());
    std::alloc::handle_alloc_error(layout)
}

/// Report an unrecoverable allocation failure and hand off to the handler.
#[cold]
#[inline(never)]
pub fn on_out_of_memory(size: usize, align: usize) -> ! {
    tracing::error!(size, align, "allocator out of memory");
    let raw = OOM_HANDLER.load(Ordering::Acquire);
    if raw == 0 {
        default_out_of_memory(size, align)
    }
    // Safety: only `set_out_of_memory_handler` stores non-zero values, and it
    // stores a valid `OutOfMemoryHandler`.
    let handler: OutOfMemoryHandler = unsafe { std::mem::transmute::<usize, OutOfMemoryHandler>(raw) };
    handler(size, align)
}
