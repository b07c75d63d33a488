//! Platform seam. The driver core talks to the SPI peripheral, the DMA
//! engine, and the card-detect input only through these traits; a board
//! crate supplies the implementations for its HAL.

use crate::types::SdError;

/// SPI peripheral operations the driver needs.
///
/// Polled exchanges spin inside the peripheral's blocking API and must
/// respect the caller-supplied bound in milliseconds. The `dma_start_*`
/// calls only kick the engine off and return; completion is reported
/// through the hooks in [`crate::dma`], and the driver keeps both buffers
/// alive until that rendezvous resolves or the transfer is aborted.
pub trait SpiOps {
    fn transmit_polled(&mut self, tx: &[u8], timeout_ms: u64) -> Result<(), SdError>;

    fn transfer_polled(&mut self, tx: &[u8], rx: &mut [u8], timeout_ms: u64)
        -> Result<(), SdError>;

    fn dma_start_transmit(&mut self, tx: &[u8]) -> Result<(), SdError>;

    fn dma_start_transfer(&mut self, tx: &[u8], rx: &mut [u8]) -> Result<(), SdError>;

    /// Stop an in-flight DMA transfer after a rendezvous timeout.
    fn dma_abort(&mut self);

    /// Flush dirty cache lines covering `len` bytes at `addr` to memory.
    /// The range is already rounded out to cache-line boundaries. No-op on
    /// cores without a data cache.
    fn cache_clean(&mut self, addr: usize, len: usize) {
        let _ = (addr, len);
    }

    /// Drop cache lines covering `len` bytes at `addr`. Rounded like
    /// [`Self::cache_clean`].
    fn cache_invalidate(&mut self, addr: usize, len: usize) {
        let _ = (addr, len);
    }

    /// True when the current context is an interrupt handler. Public
    /// operations fail fast with `Busy` instead of suspending there.
    fn in_isr() -> bool {
        false
    }
}

/// Polled card-presence input.
pub trait CardDetect {
    fn card_present(&self) -> bool;
}

/// Placeholder detect for sockets without a presence switch; the card is
/// assumed present.
#[derive(Clone, Copy, Default)]
pub struct NoCardDetect;

impl CardDetect for NoCardDetect {
    fn card_present(&self) -> bool {
        true
    }
}
