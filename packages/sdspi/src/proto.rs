//! SD-SPI protocol primitives: command framing, response handling, data
//! tokens, and the time-bounded wait loops.

use embassy_time::{Duration, Instant, Timer};
use embedded_hal::digital::OutputPin;

use crate::bus::BusGuard;
use crate::config::{CMD_TIMEOUT_MS, DATA_TOKEN_TIMEOUT_MS, SPI_IO_TIMEOUT_MS};
use crate::dma::DmaRendezvous;
use crate::platform::SpiOps;
use crate::types::SdError;

pub(crate) const CMD0: u8 = 0;
pub(crate) const CMD8: u8 = 8;
pub(crate) const CMD9: u8 = 9;
pub(crate) const CMD12: u8 = 12;
pub(crate) const CMD16: u8 = 16;
pub(crate) const CMD17: u8 = 17;
pub(crate) const CMD18: u8 = 18;
pub(crate) const CMD24: u8 = 24;
pub(crate) const CMD25: u8 = 25;
pub(crate) const CMD55: u8 = 55;
pub(crate) const CMD58: u8 = 58;
pub(crate) const ACMD41: u8 = 41;

/// Only CMD0 and CMD8 carry a real CRC7 in SPI mode.
pub(crate) const CRC_CMD0: u8 = 0x95;
pub(crate) const CRC_CMD8: u8 = 0x87;
pub(crate) const CRC_NONE: u8 = 0xFF;

pub(crate) const R1_IDLE: u8 = 0x01;
pub(crate) const R1_READY: u8 = 0x00;

pub(crate) const TOKEN_START_BLOCK: u8 = 0xFE;
pub(crate) const TOKEN_START_MULTI_WRITE: u8 = 0xFC;
pub(crate) const TOKEN_STOP_TRAN: u8 = 0xFD;

const DATA_RESP_MASK: u8 = 0x1F;
const DATA_RESP_ACCEPTED: u8 = 0x05;
const DATA_RESP_CRC_ERR: u8 = 0x0B;

/// Response polls after a command frame before giving up on R1.
const RESPONSE_POLLS: u8 = 10;

const CSD_LEN: usize = 16;

/// Classify the data response that follows a written block.
pub(crate) fn check_data_response(byte: u8) -> Result<(), SdError> {
    match byte & DATA_RESP_MASK {
        DATA_RESP_ACCEPTED => Ok(()),
        DATA_RESP_CRC_ERR => Err(SdError::CrcError),
        _ => Err(SdError::WriteError),
    }
}

impl<SPI: SpiOps, CS: OutputPin> BusGuard<'_, SPI, CS> {
    /// Frame and send one command, returning its R1 response. Waits for the
    /// card to present 0xFF first, then clocks a dummy byte, the 6-byte
    /// packet, and up to [`RESPONSE_POLLS`] bytes for the MSB-clear reply.
    pub(crate) async fn command(&mut self, cmd: u8, arg: u32, crc: u8) -> Result<u8, SdError> {
        self.wait_ready(CMD_TIMEOUT_MS).await?;

        self.transmit_byte(0xFF)?;
        let frame = [
            0x40 | cmd,
            (arg >> 24) as u8,
            (arg >> 16) as u8,
            (arg >> 8) as u8,
            arg as u8,
            crc,
        ];
        for byte in frame {
            self.transmit_byte(byte)?;
        }

        for _ in 0..RESPONSE_POLLS {
            let r1 = self.receive_byte(SPI_IO_TIMEOUT_MS)?;
            if r1 & 0x80 == 0 {
                return Ok(r1);
            }
        }
        Err(SdError::Timeout)
    }

    /// Read the 4-byte payload that trails R1 on R3 (OCR) and R7 responses.
    pub(crate) fn read_trailing(&mut self, out: &mut [u8; 4]) -> Result<(), SdError> {
        for slot in out {
            *slot = self.receive_byte(SPI_IO_TIMEOUT_MS)?;
        }
        Ok(())
    }

    /// CMD9 body: wait for the start token, then the 16 CSD bytes and the
    /// two CRC bytes nobody checks in SPI mode.
    pub(crate) async fn read_csd(&mut self, dma: &DmaRendezvous) -> Result<[u8; CSD_LEN], SdError> {
        let r1 = self
            .command(CMD9, 0, CRC_NONE)
            .await
            .map_err(|_| SdError::Error)?;
        if r1 != R1_READY {
            return Err(SdError::Error);
        }

        self.wait_data_token(DATA_TOKEN_TIMEOUT_MS).await?;

        let mut csd = [0u8; CSD_LEN];
        self.bus.exchange(&mut csd, dma, false).await?;
        self.discard_crc()?;
        Ok(csd)
    }

    pub(crate) fn discard_crc(&mut self) -> Result<(), SdError> {
        self.receive_byte(SPI_IO_TIMEOUT_MS)?;
        self.receive_byte(SPI_IO_TIMEOUT_MS)?;
        Ok(())
    }

    /// Poll until the card presents 0xFF, backing off a millisecond per
    /// attempt until the deadline.
    pub(crate) async fn wait_ready(&mut self, timeout_ms: u64) -> Result<(), SdError> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let io_timeout = timeout_ms.clamp(1, SPI_IO_TIMEOUT_MS);
        loop {
            let byte = self.receive_byte(io_timeout).map_err(|_| SdError::Error)?;
            if byte == 0xFF {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(SdError::Timeout);
            }
            Timer::after_millis(1).await;
        }
    }

    /// Poll for the 0xFE start-block token with the same backoff scheme.
    pub(crate) async fn wait_data_token(&mut self, timeout_ms: u64) -> Result<(), SdError> {
        let deadline = Instant::now() + Duration::from_millis(timeout_ms);
        let io_timeout = timeout_ms.clamp(1, SPI_IO_TIMEOUT_MS);
        loop {
            let byte = self.receive_byte(io_timeout).map_err(|_| SdError::Error)?;
            if byte == TOKEN_START_BLOCK {
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(SdError::Timeout);
            }
            Timer::after_millis(1).await;
        }
    }
}
