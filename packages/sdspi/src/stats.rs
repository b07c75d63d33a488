use core::sync::atomic::{AtomicU32, Ordering};

use crate::types::{SdError, SdStats};

/// Monotonic driver counters. Atomic so the `Busy` and `NoMedia` paths can
/// account themselves without holding the handle mutex.
#[derive(Default)]
pub(crate) struct StatCounters {
    read_ops: AtomicU32,
    write_ops: AtomicU32,
    read_blocks: AtomicU32,
    write_blocks: AtomicU32,
    init_attempts: AtomicU32,
    error_count: AtomicU32,
    timeout_count: AtomicU32,
}

impl StatCounters {
    pub(crate) const fn new() -> Self {
        Self {
            read_ops: AtomicU32::new(0),
            write_ops: AtomicU32::new(0),
            read_blocks: AtomicU32::new(0),
            write_blocks: AtomicU32::new(0),
            init_attempts: AtomicU32::new(0),
            error_count: AtomicU32::new(0),
            timeout_count: AtomicU32::new(0),
        }
    }

    pub(crate) fn note_read(&self, blocks: u32) {
        self.read_ops.fetch_add(1, Ordering::Relaxed);
        self.read_blocks.fetch_add(blocks, Ordering::Relaxed);
    }

    pub(crate) fn note_write(&self, blocks: u32) {
        self.write_ops.fetch_add(1, Ordering::Relaxed);
        self.write_blocks.fetch_add(blocks, Ordering::Relaxed);
    }

    pub(crate) fn note_init_attempt(&self) {
        self.init_attempts.fetch_add(1, Ordering::Relaxed);
    }

    pub(crate) fn note_outcome(&self, result: Result<(), SdError>) {
        if let Err(err) = result {
            self.error_count.fetch_add(1, Ordering::Relaxed);
            if err == SdError::Timeout {
                self.timeout_count.fetch_add(1, Ordering::Relaxed);
            }
        }
    }

    pub(crate) fn snapshot(&self) -> SdStats {
        SdStats {
            read_ops: self.read_ops.load(Ordering::Relaxed),
            write_ops: self.write_ops.load(Ordering::Relaxed),
            read_blocks: self.read_blocks.load(Ordering::Relaxed),
            write_blocks: self.write_blocks.load(Ordering::Relaxed),
            init_attempts: self.init_attempts.load(Ordering::Relaxed),
            error_count: self.error_count.load(Ordering::Relaxed),
            timeout_count: self.timeout_count.load(Ordering::Relaxed),
        }
    }

    pub(crate) fn reset(&self) {
        self.read_ops.store(0, Ordering::Relaxed);
        self.write_ops.store(0, Ordering::Relaxed);
        self.read_blocks.store(0, Ordering::Relaxed);
        self.write_blocks.store(0, Ordering::Relaxed);
        self.init_attempts.store(0, Ordering::Relaxed);
        self.error_count.store(0, Ordering::Relaxed);
        self.timeout_count.store(0, Ordering::Relaxed);
    }
}
