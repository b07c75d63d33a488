//! The SD handle and its block I/O engine: public read/write/sync entry
//! points, locking, the presence gate, retry policy, and statistics.

use core::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};

use embassy_sync::blocking_mutex::raw::CriticalSectionRawMutex;
use embassy_sync::mutex::{Mutex, MutexGuard};
use embassy_time::{with_timeout, Duration, Timer};
use embedded_hal::digital::OutputPin;

use crate::bus::{BusGuard, SdBus};
use crate::config::{BLOCK_SIZE, MAX_RETRIES, MUTEX_TIMEOUT_MS, WRITE_BUSY_TIMEOUT_MS};
use crate::dma::{self, DmaRendezvous};
use crate::platform::{CardDetect, NoCardDetect, SpiOps};
use crate::proto::{
    check_data_response, CMD12, CMD17, CMD18, CMD24, CMD25, CRC_NONE, R1_READY,
    TOKEN_START_BLOCK, TOKEN_START_MULTI_WRITE, TOKEN_STOP_TRAN,
};
use crate::stats::StatCounters;
use crate::types::{SdError, SdStats};

type Bus<SPI, CS> = Mutex<CriticalSectionRawMutex, SdBus<SPI, CS>>;
type BusLock<'a, SPI, CS> = MutexGuard<'a, CriticalSectionRawMutex, SdBus<SPI, CS>>;

/// One SPI-attached SD card. Shared by reference between tasks; every
/// public operation serializes on the internal mutex and leaves chip select
/// deasserted before returning.
pub struct SdCard<SPI, CS, CD = NoCardDetect> {
    bus: Bus<SPI, CS>,
    dma: DmaRendezvous,
    detect: CD,
    initialized: AtomicBool,
    sdhc: AtomicBool,
    capacity_blocks: AtomicU32,
    last_status: AtomicU8,
    stats: StatCounters,
}

impl<SPI: SpiOps, CS: OutputPin> SdCard<SPI, CS, NoCardDetect> {
    /// Bind the handle to its SPI peripheral and chip-select pin. No bus
    /// traffic happens until [`SdCard::init`].
    pub fn new(spi: SPI, cs: CS, use_dma: bool) -> Self {
        Self::with_card_detect(spi, cs, use_dma, NoCardDetect)
    }
}

impl<SPI: SpiOps, CS: OutputPin, CD: CardDetect> SdCard<SPI, CS, CD> {
    /// As [`SdCard::new`], with a polled card-detect input.
    pub fn with_card_detect(spi: SPI, cs: CS, use_dma: bool, detect: CD) -> Self {
        Self {
            bus: Mutex::new(SdBus::new(spi, cs, use_dma)),
            dma: DmaRendezvous::new(),
            detect,
            initialized: AtomicBool::new(false),
            sdhc: AtomicBool::new(false),
            capacity_blocks: AtomicU32::new(0),
            last_status: AtomicU8::new(0),
            stats: StatCounters::new(),
        }
    }

    /// Register this handle as the owner of SPI DMA completion interrupts.
    /// Required before any DMA transfer can complete.
    pub fn bind_dma(&'static self) {
        dma::bind(&self.dma);
    }

    /// Tear the handle down: the next I/O requires a fresh [`SdCard::init`]
    /// and DMA completions are no longer routed here.
    pub fn deinit(&self) {
        self.initialized.store(false, Ordering::Release);
        dma::unbind(&self.dma);
    }

    /// Card presence as reported by card-detect; true when none is wired.
    pub fn is_card_present(&self) -> bool {
        self.detect.card_present()
    }

    pub fn is_initialized(&self) -> bool {
        self.initialized.load(Ordering::Acquire)
    }

    pub fn is_sdhc(&self) -> bool {
        self.sdhc.load(Ordering::Acquire)
    }

    /// Capacity in 512-byte blocks, 0 until the CSD has been parsed.
    pub fn capacity_blocks(&self) -> u32 {
        self.capacity_blocks.load(Ordering::Acquire)
    }

    pub const fn block_size(&self) -> usize {
        BLOCK_SIZE
    }

    /// Outcome of the most recent public operation.
    pub fn last_status(&self) -> Result<(), SdError> {
        match SdError::from_code(self.last_status.load(Ordering::Acquire)) {
            None => Ok(()),
            Some(err) => Err(err),
        }
    }

    pub fn stats(&self) -> SdStats {
        self.stats.snapshot()
    }

    pub fn reset_stats(&self) {
        self.stats.reset();
    }

    /// Read `count` blocks starting at `sector` into `buf` (must be exactly
    /// `count * 512` bytes). Single-block reads retry; multi-block reads
    /// terminate with STOP_TRANSMISSION and report the first failure.
    pub async fn read_blocks(
        &self,
        buf: &mut [u8],
        sector: u32,
        count: u32,
    ) -> Result<(), SdError> {
        if count == 0 || buf.len() != count as usize * BLOCK_SIZE {
            return self.record(Err(SdError::Param));
        }
        if !self.is_card_present() {
            self.initialized.store(false, Ordering::Release);
            return self.record(Err(SdError::NoMedia));
        }

        let mut bus = match self.lock().await {
            Ok(bus) => bus,
            Err(err) => return self.record(Err(err)),
        };
        if !self.is_initialized() {
            return self.record(Err(SdError::Error));
        }

        self.stats.note_read(count);
        let address = self.block_address(sector);

        let result = if count == 1 {
            let mut result = Ok(());
            for attempt in 0..=MAX_RETRIES {
                result = Self::read_single(&mut bus, &self.dma, buf, address).await;
                if result.is_ok() {
                    break;
                }
                if attempt < MAX_RETRIES {
                    Timer::after_millis(1).await;
                }
            }
            result
        } else {
            Self::read_multi(&mut bus, &self.dma, buf, address).await
        };
        drop(bus);
        self.record(result)
    }

    /// Write `count` blocks from `buf` starting at `sector`; the mirror of
    /// [`SdCard::read_blocks`].
    pub async fn write_blocks(&self, buf: &[u8], sector: u32, count: u32) -> Result<(), SdError> {
        if count == 0 || buf.len() != count as usize * BLOCK_SIZE {
            return self.record(Err(SdError::Param));
        }
        if !self.is_card_present() {
            self.initialized.store(false, Ordering::Release);
            return self.record(Err(SdError::NoMedia));
        }

        let mut bus = match self.lock().await {
            Ok(bus) => bus,
            Err(err) => return self.record(Err(err)),
        };
        if !self.is_initialized() {
            return self.record(Err(SdError::Error));
        }

        self.stats.note_write(count);
        let address = self.block_address(sector);

        let result = if count == 1 {
            let mut result = Ok(());
            for attempt in 0..=MAX_RETRIES {
                result = Self::write_single(&mut bus, &self.dma, buf, address).await;
                if result.is_ok() {
                    break;
                }
                if attempt < MAX_RETRIES {
                    Timer::after_millis(1).await;
                }
            }
            result
        } else {
            Self::write_multi(&mut bus, &self.dma, buf, address).await
        };
        drop(bus);
        self.record(result)
    }

    /// Wait for any in-flight programming to finish.
    pub async fn sync(&self) -> Result<(), SdError> {
        if !self.is_card_present() {
            self.initialized.store(false, Ordering::Release);
            return self.record(Err(SdError::NoMedia));
        }
        if !self.is_initialized() {
            return self.record(Err(SdError::Error));
        }

        let mut bus = match self.lock().await {
            Ok(bus) => bus,
            Err(err) => return self.record(Err(err)),
        };
        let result = {
            let mut guard = bus.select();
            guard.wait_ready(WRITE_BUSY_TIMEOUT_MS).await
        };
        drop(bus);
        self.record(result)
    }

    /// SDHC cards are sector-addressed; SDSC cards take byte addresses.
    fn block_address(&self, sector: u32) -> u32 {
        if self.is_sdhc() {
            sector
        } else {
            sector.saturating_mul(BLOCK_SIZE as u32)
        }
    }

    pub(crate) async fn lock(&self) -> Result<BusLock<'_, SPI, CS>, SdError> {
        if SPI::in_isr() {
            return Err(SdError::Busy);
        }
        with_timeout(Duration::from_millis(MUTEX_TIMEOUT_MS), self.bus.lock())
            .await
            .map_err(|_| SdError::Busy)
    }

    pub(crate) fn record(&self, result: Result<(), SdError>) -> Result<(), SdError> {
        let code = match result {
            Ok(()) => 0,
            Err(err) => err.code(),
        };
        self.last_status.store(code, Ordering::Release);
        self.stats.note_outcome(result);
        result
    }

    pub(crate) fn stats_counters(&self) -> &StatCounters {
        &self.stats
    }

    pub(crate) fn mark_initialized(&self, sdhc: bool, capacity_blocks: u32) {
        self.sdhc.store(sdhc, Ordering::Release);
        self.capacity_blocks.store(capacity_blocks, Ordering::Release);
        self.initialized.store(true, Ordering::Release);
    }

    pub(crate) fn clear_initialized(&self) {
        self.initialized.store(false, Ordering::Release);
    }

    pub(crate) fn dma_rendezvous(&self) -> &DmaRendezvous {
        &self.dma
    }

    async fn read_single(
        bus: &mut SdBus<SPI, CS>,
        dma: &DmaRendezvous,
        buf: &mut [u8],
        address: u32,
    ) -> Result<(), SdError> {
        let mut guard = bus.select();
        let r1 = guard
            .command(CMD17, address, CRC_NONE)
            .await
            .map_err(|_| SdError::Error)?;
        if r1 != R1_READY {
            return Err(SdError::Error);
        }
        guard.read_block_payload(buf, dma).await
    }

    async fn read_multi(
        bus: &mut SdBus<SPI, CS>,
        dma: &DmaRendezvous,
        buf: &mut [u8],
        address: u32,
    ) -> Result<(), SdError> {
        let mut guard = bus.select();
        let r1 = guard
            .command(CMD18, address, CRC_NONE)
            .await
            .map_err(|_| SdError::Error)?;
        if r1 != R1_READY {
            return Err(SdError::Error);
        }

        let mut result = Ok(());
        for chunk in buf.chunks_exact_mut(BLOCK_SIZE) {
            if let Err(err) = guard.read_block_payload(chunk, dma).await {
                result = Err(err);
                break;
            }
        }

        // Terminate the stream whether or not every block arrived.
        let _ = guard.command(CMD12, 0, CRC_NONE).await;
        result
    }

    async fn write_single(
        bus: &mut SdBus<SPI, CS>,
        dma: &DmaRendezvous,
        buf: &[u8],
        address: u32,
    ) -> Result<(), SdError> {
        let mut guard = bus.select();
        let r1 = guard
            .command(CMD24, address, CRC_NONE)
            .await
            .map_err(|_| SdError::Error)?;
        if r1 != R1_READY {
            return Err(SdError::Error);
        }
        guard
            .write_block_payload(TOKEN_START_BLOCK, buf, dma)
            .await?;
        guard.wait_ready(WRITE_BUSY_TIMEOUT_MS).await
    }

    async fn write_multi(
        bus: &mut SdBus<SPI, CS>,
        dma: &DmaRendezvous,
        buf: &[u8],
        address: u32,
    ) -> Result<(), SdError> {
        let mut guard = bus.select();
        let r1 = guard
            .command(CMD25, address, CRC_NONE)
            .await
            .map_err(|_| SdError::Error)?;
        if r1 != R1_READY {
            return Err(SdError::Error);
        }

        let mut result = Ok(());
        for chunk in buf.chunks_exact(BLOCK_SIZE) {
            if let Err(err) = guard
                .write_block_payload(TOKEN_START_MULTI_WRITE, chunk, dma)
                .await
            {
                result = Err(err);
                break;
            }
            if let Err(err) = guard.wait_ready(WRITE_BUSY_TIMEOUT_MS).await {
                result = Err(err);
                break;
            }
        }

        // The stop token goes out even after a failed block so the card
        // leaves multi-write state; the final program wait is best effort.
        let _ = guard.transmit_byte(TOKEN_STOP_TRAN);
        let _ = guard.wait_ready(WRITE_BUSY_TIMEOUT_MS).await;
        result
    }
}

impl<SPI: SpiOps, CS: OutputPin> BusGuard<'_, SPI, CS> {
    /// Token wait, 512-byte payload, and the two discarded CRC bytes of one
    /// read block.
    async fn read_block_payload(
        &mut self,
        chunk: &mut [u8],
        dma: &DmaRendezvous,
    ) -> Result<(), SdError> {
        self.wait_data_token(crate::config::DATA_TOKEN_TIMEOUT_MS)
            .await?;
        self.exchange_block(chunk, dma).await?;
        self.discard_crc()
    }

    /// Start token, 512-byte payload, CRC filler, and data-response
    /// classification of one written block.
    async fn write_block_payload(
        &mut self,
        token: u8,
        chunk: &[u8],
        dma: &DmaRendezvous,
    ) -> Result<(), SdError> {
        self.transmit_byte(token)?;
        self.transmit_block(chunk, dma).await?;
        self.transmit_byte(0xFF)?;
        self.transmit_byte(0xFF)?;
        let response = self.receive_byte(crate::config::SPI_IO_TIMEOUT_MS)?;
        check_data_response(response)
    }
}
