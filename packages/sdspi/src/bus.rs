//! SPI transport: chip-select framing, byte exchanges, and the DMA-or-polled
//! block path with cache maintenance.

use embedded_hal::digital::OutputPin;

use crate::config::{BLOCK_SIZE, SPI_IO_TIMEOUT_MS};
use crate::dma::{cache_span, dma_aligned, DmaRendezvous};
use crate::platform::SpiOps;
use crate::types::SdError;

/// 0xFF clock filler for receive exchanges, aligned so the DMA path can use
/// it directly.
#[repr(align(32))]
struct FillBlock([u8; BLOCK_SIZE]);

static FILL_BLOCK: FillBlock = FillBlock([0xFF; BLOCK_SIZE]);

/// The bus half of the handle; lives inside the handle mutex.
pub(crate) struct SdBus<SPI, CS> {
    spi: SPI,
    cs: CS,
    use_dma: bool,
}

impl<SPI: SpiOps, CS: OutputPin> SdBus<SPI, CS> {
    pub(crate) fn new(spi: SPI, cs: CS, use_dma: bool) -> Self {
        let mut bus = Self { spi, cs, use_dma };
        let _ = bus.cs.set_high();
        bus
    }

    /// Assert chip select. The returned guard deasserts it and clocks the
    /// trailing 0xFF on every exit path.
    pub(crate) fn select(&mut self) -> BusGuard<'_, SPI, CS> {
        let _ = self.cs.set_low();
        BusGuard { bus: self }
    }

    fn deselect(&mut self) {
        let _ = self.cs.set_high();
        let _ = self.spi.transmit_polled(&[0xFF], SPI_IO_TIMEOUT_MS);
    }

    /// Clock dummy bytes with chip select released (power-up ramp).
    pub(crate) fn send_dummy_clocks(&mut self, bytes: usize) -> Result<(), SdError> {
        let _ = self.cs.set_high();
        for _ in 0..bytes {
            self.spi.transmit_polled(&[0xFF], SPI_IO_TIMEOUT_MS)?;
        }
        Ok(())
    }

    pub(crate) fn transmit_byte(&mut self, byte: u8) -> Result<(), SdError> {
        self.spi.transmit_polled(&[byte], SPI_IO_TIMEOUT_MS)
    }

    pub(crate) fn receive_byte(&mut self, timeout_ms: u64) -> Result<u8, SdError> {
        let mut rx = [0u8];
        self.spi.transfer_polled(&[0xFF], &mut rx, timeout_ms)?;
        Ok(rx[0])
    }

    /// Full-duplex exchange of `rx.len()` bytes clocked with 0xFF filler.
    /// Takes the DMA path only when the policy and `rx` alignment allow it;
    /// the polled fallback produces identical bytes on the wire.
    pub(crate) async fn exchange(
        &mut self,
        rx: &mut [u8],
        dma: &DmaRendezvous,
        allow_dma: bool,
    ) -> Result<(), SdError> {
        let tx = &FILL_BLOCK.0[..rx.len()];
        if allow_dma {
            dma.arm_rx();
            let (tx_addr, tx_len) = cache_span(tx.as_ptr() as usize, tx.len());
            self.spi.cache_clean(tx_addr, tx_len);
            let (rx_addr, rx_len) = cache_span(rx.as_ptr() as usize, rx.len());
            self.spi.cache_invalidate(rx_addr, rx_len);
            self.spi.dma_start_transfer(tx, rx)?;
            match dma.wait_rx().await {
                Ok(()) => {
                    self.spi.cache_invalidate(rx_addr, rx_len);
                    Ok(())
                }
                Err(SdError::Timeout) => {
                    self.spi.dma_abort();
                    Err(SdError::Timeout)
                }
                Err(err) => Err(err),
            }
        } else {
            self.spi.transfer_polled(tx, rx, SPI_IO_TIMEOUT_MS)
        }
    }

    pub(crate) async fn transmit(
        &mut self,
        tx: &[u8],
        dma: &DmaRendezvous,
        allow_dma: bool,
    ) -> Result<(), SdError> {
        if allow_dma {
            dma.arm_tx();
            let (addr, len) = cache_span(tx.as_ptr() as usize, tx.len());
            self.spi.cache_clean(addr, len);
            self.spi.dma_start_transmit(tx)?;
            match dma.wait_tx().await {
                Ok(()) => Ok(()),
                Err(SdError::Timeout) => {
                    self.spi.dma_abort();
                    Err(SdError::Timeout)
                }
                Err(err) => Err(err),
            }
        } else {
            self.spi.transmit_polled(tx, SPI_IO_TIMEOUT_MS)
        }
    }

    pub(crate) fn dma_eligible(&self, ptr: *const u8) -> bool {
        self.use_dma && dma_aligned(ptr)
    }
}

/// Chip-select bracket. Every command/response sequence runs inside one of
/// these; dropping it deasserts CS and sends the trailing 0xFF that advances
/// the card's SPI state machine, early-exit paths included.
pub(crate) struct BusGuard<'a, SPI: SpiOps, CS: OutputPin> {
    pub(crate) bus: &'a mut SdBus<SPI, CS>,
}

impl<SPI: SpiOps, CS: OutputPin> Drop for BusGuard<'_, SPI, CS> {
    fn drop(&mut self) {
        self.bus.deselect();
    }
}

impl<SPI: SpiOps, CS: OutputPin> BusGuard<'_, SPI, CS> {
    pub(crate) fn transmit_byte(&mut self, byte: u8) -> Result<(), SdError> {
        self.bus.transmit_byte(byte)
    }

    pub(crate) fn receive_byte(&mut self, timeout_ms: u64) -> Result<u8, SdError> {
        self.bus.receive_byte(timeout_ms)
    }

    /// Read one 512-byte block payload into `chunk`.
    pub(crate) async fn exchange_block(
        &mut self,
        chunk: &mut [u8],
        dma: &DmaRendezvous,
    ) -> Result<(), SdError> {
        let allow_dma = self.bus.dma_eligible(chunk.as_ptr());
        self.bus.exchange(chunk, dma, allow_dma).await
    }

    /// Send one 512-byte block payload from `chunk`.
    pub(crate) async fn transmit_block(
        &mut self,
        chunk: &[u8],
        dma: &DmaRendezvous,
    ) -> Result<(), SdError> {
        let allow_dma = self.bus.dma_eligible(chunk.as_ptr());
        self.bus.transmit(chunk, dma, allow_dma).await
    }
}

#[cfg(test)]
mod tests {
    use embassy_futures::block_on;

    use crate::config::{BLOCK_SIZE, DMA_ALIGNMENT};
    use crate::sim::{dma_owner_lock, rig, CardKind, Rig, SimCs, SimDetect, SimSpi};
    use crate::types::SdError;
    use crate::SdCard;

    #[repr(align(32))]
    struct AlignedStorage([u8; BLOCK_SIZE + 32]);

    #[test]
    fn dma_runs_only_for_aligned_buffers() {
        let _serial = dma_owner_lock();
        let Rig {
            sd,
            card,
            dma_transfers,
            ..
        } = rig(CardKind::Sdhc, true);
        let sd: &'static SdCard<SimSpi, SimCs, SimDetect> = Box::leak(Box::new(sd));
        sd.bind_dma();

        block_on(sd.init()).unwrap();
        // Bring-up moves no data blocks, so the engine stayed idle.
        assert_eq!(dma_transfers.get(), 0);

        let mut storage = AlignedStorage([0u8; BLOCK_SIZE + 32]);
        block_on(sd.read_blocks(&mut storage.0[..BLOCK_SIZE], 4, 1)).unwrap();
        assert_eq!(dma_transfers.get(), 1);
        assert_eq!(&storage.0[..BLOCK_SIZE], &card.borrow().block(4)[..]);

        // An unaligned view of the same storage takes the polled path and
        // produces identical bytes.
        block_on(sd.read_blocks(&mut storage.0[1..BLOCK_SIZE + 1], 4, 1)).unwrap();
        assert_eq!(dma_transfers.get(), 1);
        assert_eq!(&storage.0[1..BLOCK_SIZE + 1], &card.borrow().block(4)[..]);

        sd.deinit();
    }

    #[test]
    fn dma_cache_maintenance_uses_rounded_spans() {
        let _serial = dma_owner_lock();
        let Rig {
            sd,
            dma_transfers,
            cache_ops,
            ..
        } = rig(CardKind::Sdhc, true);
        let sd: &'static SdCard<SimSpi, SimCs, SimDetect> = Box::leak(Box::new(sd));
        sd.bind_dma();
        block_on(sd.init()).unwrap();
        cache_ops.borrow_mut().clear();

        let mut storage = AlignedStorage([0x42u8; BLOCK_SIZE + 32]);
        block_on(sd.write_blocks(&storage.0[..BLOCK_SIZE], 2, 1)).unwrap();
        assert_eq!(dma_transfers.get(), 1);

        {
            let ops = cache_ops.borrow();
            assert!(ops.iter().any(|(kind, _, _)| *kind == "clean"));
            assert!(ops
                .iter()
                .all(|(_, addr, len)| addr % DMA_ALIGNMENT == 0 && len % DMA_ALIGNMENT == 0));
        }

        cache_ops.borrow_mut().clear();
        block_on(sd.read_blocks(&mut storage.0[..BLOCK_SIZE], 2, 1)).unwrap();
        {
            let ops = cache_ops.borrow();
            // Receive buffers are invalidated before and after the transfer.
            assert!(
                ops.iter()
                    .filter(|(kind, _, _)| *kind == "invalidate")
                    .count()
                    >= 2
            );
        }

        sd.deinit();
    }

    #[test]
    fn dma_start_failure_reports_error() {
        let _serial = dma_owner_lock();
        let Rig {
            sd,
            fail_dma_start,
            dma_aborts,
            ..
        } = rig(CardKind::Sdhc, true);
        let sd: &'static SdCard<SimSpi, SimCs, SimDetect> = Box::leak(Box::new(sd));
        sd.bind_dma();
        block_on(sd.init()).unwrap();

        fail_dma_start.set(true);
        let mut storage = AlignedStorage([0u8; BLOCK_SIZE + 32]);
        assert_eq!(
            block_on(sd.read_blocks(&mut storage.0[..BLOCK_SIZE], 1, 1)),
            Err(SdError::Error)
        );
        // An issue error never started the engine, so nothing to abort.
        assert_eq!(dma_aborts.get(), 0);

        sd.deinit();
    }

    #[test]
    fn dma_completion_timeout_aborts_the_transfer() {
        let _serial = dma_owner_lock();
        let Rig {
            sd,
            swallow_dma_completion,
            dma_aborts,
            ..
        } = rig(CardKind::Sdhc, true);
        let sd: &'static SdCard<SimSpi, SimCs, SimDetect> = Box::leak(Box::new(sd));
        sd.bind_dma();
        block_on(sd.init()).unwrap();

        swallow_dma_completion.set(true);
        let mut storage = AlignedStorage([0u8; BLOCK_SIZE + 32]);
        assert_eq!(
            block_on(sd.read_blocks(&mut storage.0[..BLOCK_SIZE], 1, 1)),
            Err(SdError::Timeout)
        );
        // Each retry armed, timed out, and aborted its own transfer.
        assert_eq!(dma_aborts.get(), 3);
        assert_eq!(sd.stats().timeout_count, 1);

        sd.deinit();
    }
}
