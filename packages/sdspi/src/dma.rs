//! DMA completion rendezvous and the interrupt-side hooks that drive it.
//!
//! Each handle owns one [`DmaRendezvous`]; [`bind`] records which handle the
//! SPI completion interrupts belong to. The board's SPI ISR forwards its
//! events through [`on_spi_tx_complete`] / [`on_spi_rx_complete`] /
//! [`on_spi_error`].

use core::cell::Cell;
use core::sync::atomic::{AtomicBool, Ordering};

#[cfg(feature = "rtos")]
use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
#[cfg(feature = "rtos")]
use embassy_sync::signal::Signal;
#[cfg(feature = "rtos")]
use embassy_time::with_timeout;
use embassy_time::Duration;
#[cfg(not(feature = "rtos"))]
use embassy_time::{Instant, Timer};

use crate::config::{DMA_ALIGNMENT, DMA_TIMEOUT_MS};
use crate::types::SdError;

#[cfg(feature = "rtos")]
#[derive(Clone, Copy, PartialEq, Eq)]
enum DmaEvent {
    Complete,
    Fault,
}

/// Completion state for one handle: a signal per direction plus the done
/// flags the polling fallback watches. The fault flag is shared; the error
/// interrupt releases both directions.
pub struct DmaRendezvous {
    #[cfg(feature = "rtos")]
    tx_signal: Signal<CriticalSectionRawMutex, DmaEvent>,
    #[cfg(feature = "rtos")]
    rx_signal: Signal<CriticalSectionRawMutex, DmaEvent>,
    tx_done: AtomicBool,
    rx_done: AtomicBool,
    fault: AtomicBool,
}

impl DmaRendezvous {
    pub(crate) const fn new() -> Self {
        Self {
            #[cfg(feature = "rtos")]
            tx_signal: Signal::new(),
            #[cfg(feature = "rtos")]
            rx_signal: Signal::new(),
            tx_done: AtomicBool::new(false),
            rx_done: AtomicBool::new(false),
            fault: AtomicBool::new(false),
        }
    }

    /// Drain any stale completion before a new transfer starts; only one
    /// transaction is ever in flight per handle.
    pub(crate) fn arm_tx(&self) {
        self.tx_done.store(false, Ordering::Release);
        self.fault.store(false, Ordering::Release);
        #[cfg(feature = "rtos")]
        self.tx_signal.reset();
    }

    pub(crate) fn arm_rx(&self) {
        self.rx_done.store(false, Ordering::Release);
        self.fault.store(false, Ordering::Release);
        #[cfg(feature = "rtos")]
        self.rx_signal.reset();
    }

    pub(crate) async fn wait_tx(&self) -> Result<(), SdError> {
        #[cfg(feature = "rtos")]
        {
            match with_timeout(Duration::from_millis(DMA_TIMEOUT_MS), self.tx_signal.wait()).await
            {
                Ok(DmaEvent::Complete) => Ok(()),
                Ok(DmaEvent::Fault) => Err(SdError::Error),
                Err(_) => Err(SdError::Timeout),
            }
        }
        #[cfg(not(feature = "rtos"))]
        {
            self.poll_done(&self.tx_done).await
        }
    }

    pub(crate) async fn wait_rx(&self) -> Result<(), SdError> {
        #[cfg(feature = "rtos")]
        {
            match with_timeout(Duration::from_millis(DMA_TIMEOUT_MS), self.rx_signal.wait()).await
            {
                Ok(DmaEvent::Complete) => Ok(()),
                Ok(DmaEvent::Fault) => Err(SdError::Error),
                Err(_) => Err(SdError::Timeout),
            }
        }
        #[cfg(not(feature = "rtos"))]
        {
            self.poll_done(&self.rx_done).await
        }
    }

    #[cfg(not(feature = "rtos"))]
    async fn poll_done(&self, done: &AtomicBool) -> Result<(), SdError> {
        let deadline = Instant::now() + Duration::from_millis(DMA_TIMEOUT_MS);
        loop {
            if done.load(Ordering::Acquire) {
                return if self.fault.load(Ordering::Acquire) {
                    Err(SdError::Error)
                } else {
                    Ok(())
                };
            }
            if Instant::now() >= deadline {
                return Err(SdError::Timeout);
            }
            Timer::after_millis(1).await;
        }
    }

    fn complete_tx(&self) {
        self.tx_done.store(true, Ordering::Release);
        #[cfg(feature = "rtos")]
        self.tx_signal.signal(DmaEvent::Complete);
    }

    fn complete_rx(&self) {
        self.rx_done.store(true, Ordering::Release);
        #[cfg(feature = "rtos")]
        self.rx_signal.signal(DmaEvent::Complete);
    }

    fn fail(&self) {
        self.fault.store(true, Ordering::Release);
        self.tx_done.store(true, Ordering::Release);
        self.rx_done.store(true, Ordering::Release);
        #[cfg(feature = "rtos")]
        {
            self.tx_signal.signal(DmaEvent::Fault);
            self.rx_signal.signal(DmaEvent::Fault);
        }
    }
}

/// Which handle currently owns SPI completion interrupts.
static OWNER: critical_section::Mutex<Cell<Option<&'static DmaRendezvous>>> =
    critical_section::Mutex::new(Cell::new(None));

pub(crate) fn bind(rendezvous: &'static DmaRendezvous) {
    critical_section::with(|cs| OWNER.borrow(cs).set(Some(rendezvous)));
}

/// Clear the owner if `rendezvous` still holds it.
pub(crate) fn unbind(rendezvous: &DmaRendezvous) {
    critical_section::with(|cs| {
        let cell = OWNER.borrow(cs);
        if let Some(owner) = cell.get() {
            if core::ptr::eq(owner, rendezvous) {
                cell.set(None);
            }
        }
    });
}

fn owner() -> Option<&'static DmaRendezvous> {
    critical_section::with(|cs| OWNER.borrow(cs).get())
}

/// SPI transmit-complete interrupt.
pub fn on_spi_tx_complete() {
    if let Some(dma) = owner() {
        dma.complete_tx();
    }
}

/// SPI receive-complete interrupt.
pub fn on_spi_rx_complete() {
    if let Some(dma) = owner() {
        dma.complete_rx();
    }
}

/// Full-duplex transfer completion reports on the receive side.
pub fn on_spi_txrx_complete() {
    on_spi_rx_complete();
}

/// SPI error interrupt: releases both directions so no initiator is left
/// waiting, and marks the transfer faulted.
pub fn on_spi_error() {
    if let Some(dma) = owner() {
        dma.fail();
    }
}

/// True when `ptr` may be handed to the DMA engine.
pub(crate) fn dma_aligned(ptr: *const u8) -> bool {
    ptr as usize % DMA_ALIGNMENT == 0
}

/// Round a buffer out to cache-line boundaries for maintenance.
pub(crate) fn cache_span(addr: usize, len: usize) -> (usize, usize) {
    let start = addr & !(DMA_ALIGNMENT - 1);
    let end = (addr + len + DMA_ALIGNMENT - 1) & !(DMA_ALIGNMENT - 1);
    (start, end - start)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_span_rounds_out_to_lines() {
        let (start, len) = cache_span(DMA_ALIGNMENT + 1, 10);
        assert_eq!(start, DMA_ALIGNMENT);
        assert_eq!(start % DMA_ALIGNMENT, 0);
        assert_eq!(len % DMA_ALIGNMENT, 0);
        assert!(start <= DMA_ALIGNMENT + 1);
        assert!(start + len >= DMA_ALIGNMENT + 1 + 10);

        let (start, len) = cache_span(2 * DMA_ALIGNMENT, DMA_ALIGNMENT);
        assert_eq!((start, len), (2 * DMA_ALIGNMENT, DMA_ALIGNMENT));
    }

    #[test]
    fn alignment_gate_matches_configured_boundary() {
        assert!(dma_aligned(core::ptr::null()));
        assert!(dma_aligned(DMA_ALIGNMENT as *const u8));
        assert!(!dma_aligned((DMA_ALIGNMENT + 1) as *const u8));
    }
}
