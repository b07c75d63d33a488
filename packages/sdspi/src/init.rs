//! Card bring-up: SPI-mode entry, voltage negotiation, capacity-class
//! discovery, and CSD capacity parsing.

use embassy_time::{Duration, Instant, Timer};
use embedded_hal::digital::OutputPin;

use crate::bus::SdBus;
use crate::config::{BLOCK_SIZE, INIT_TIMEOUT_MS};
use crate::csd::decode_capacity_blocks;
use crate::dma::DmaRendezvous;
use crate::platform::{CardDetect, SpiOps};
use crate::proto::{
    ACMD41, CMD0, CMD16, CMD55, CMD58, CMD8, CRC_CMD0, CRC_CMD8, CRC_NONE, R1_IDLE, R1_READY,
};
use crate::types::SdError;

/// HCS bit in the ACMD41 argument: host supports high-capacity cards.
const ACMD41_HCS: u32 = 0x4000_0000;
/// CMD8 argument: 2.7-3.6 V window plus the 0xAA check pattern.
const CMD8_VHS_PATTERN: u32 = 0x0000_01AA;
/// CCS flag in OCR byte 0: sector-addressed card.
const OCR_CCS: u8 = 0x40;

struct CardProfile {
    sdhc: bool,
    capacity_blocks: u32,
}

impl<SPI: SpiOps, CS: OutputPin, CD: CardDetect> crate::SdCard<SPI, CS, CD> {
    /// Run the full power-up sequence. Any protocol failure leaves the
    /// handle uninitialized; calling again restarts from the top.
    pub async fn init(&self) -> Result<(), SdError> {
        if !self.is_card_present() {
            self.clear_initialized();
            return self.record(Err(SdError::NoMedia));
        }

        self.stats_counters().note_init_attempt();

        let mut bus = match self.lock().await {
            Ok(bus) => bus,
            Err(err) => return self.record(Err(err)),
        };
        self.clear_initialized();

        let result = init_sequence(&mut bus, self.dma_rendezvous()).await;
        drop(bus);
        match result {
            Ok(profile) => {
                self.mark_initialized(profile.sdhc, profile.capacity_blocks);
                self.record(Ok(()))
            }
            Err(err) => self.record(Err(err)),
        }
    }
}

async fn init_sequence<SPI: SpiOps, CS: OutputPin>(
    bus: &mut SdBus<SPI, CS>,
    dma: &DmaRendezvous,
) -> Result<CardProfile, SdError> {
    // At least 74 clocks with CS released bring the card into SPI mode.
    bus.send_dummy_clocks(10)?;

    // CMD0 until the card reports idle state.
    let deadline = Instant::now() + Duration::from_millis(INIT_TIMEOUT_MS);
    let mut r1 = 0xFF;
    loop {
        {
            let mut guard = bus.select();
            if let Ok(resp) = guard.command(CMD0, 0, CRC_CMD0).await {
                r1 = resp;
            }
        }
        if r1 == R1_IDLE {
            break;
        }
        if Instant::now() >= deadline {
            break;
        }
        Timer::after_millis(1).await;
    }
    if r1 != R1_IDLE {
        return Err(SdError::Error);
    }

    // CMD8 voltage check. A v2 card echoes the pattern back in R7; anything
    // else (illegal command included) is treated as a legacy v1 card.
    let mut sdv2 = false;
    {
        let mut guard = bus.select();
        if let Ok(r1) = guard.command(CMD8, CMD8_VHS_PATTERN, CRC_CMD8).await {
            let mut r7 = [0u8; 4];
            guard.read_trailing(&mut r7)?;
            sdv2 = r1 == R1_IDLE && r7[2] == 0x01 && r7[3] == 0xAA;
        }
    }

    // ACMD41 with the HCS bit (v2 only) until the card leaves idle.
    let acmd41_arg = if sdv2 { ACMD41_HCS } else { 0 };
    let deadline = Instant::now() + Duration::from_millis(INIT_TIMEOUT_MS);
    let mut r1 = 0xFF;
    loop {
        {
            let mut guard = bus.select();
            let _ = guard.command(CMD55, 0, CRC_NONE).await;
            if let Ok(resp) = guard.command(ACMD41, acmd41_arg, CRC_NONE).await {
                r1 = resp;
            }
        }
        if r1 == R1_READY {
            break;
        }
        if Instant::now() >= deadline {
            break;
        }
        Timer::after_millis(1).await;
    }
    if r1 != R1_READY {
        return Err(SdError::Timeout);
    }

    // CMD58: the CCS bit in the OCR separates sector- from byte-addressed
    // cards.
    let mut sdhc = false;
    {
        let mut guard = bus.select();
        if let Ok(r1) = guard.command(CMD58, 0, CRC_NONE).await {
            if r1 == R1_READY {
                let mut ocr = [0u8; 4];
                guard.read_trailing(&mut ocr)?;
                sdhc = ocr[0] & OCR_CCS != 0;
            }
        }
    }

    // Byte-addressed cards must be pinned to 512-byte blocks.
    if !sdhc {
        let mut guard = bus.select();
        let r1 = guard
            .command(CMD16, BLOCK_SIZE as u32, CRC_NONE)
            .await
            .map_err(|_| SdError::Error)?;
        if r1 != R1_READY {
            return Err(SdError::Error);
        }
    }

    // CSD read failures leave capacity unknown rather than failing the
    // bring-up; the disk layer rejects a zero capacity where it matters.
    let capacity_blocks = {
        let mut guard = bus.select();
        match guard.read_csd(dma).await {
            Ok(csd) => decode_capacity_blocks(&csd),
            Err(_) => 0,
        }
    };

    Ok(CardProfile {
        sdhc,
        capacity_blocks,
    })
}

#[cfg(test)]
mod tests {
    use embassy_futures::block_on;

    use crate::sim::{rig, CardKind};
    use crate::types::SdError;

    #[test]
    fn sdhc_bring_up_follows_the_v2_sequence() {
        let r = rig(CardKind::Sdhc, false);
        r.card.borrow_mut().acmd41_idle_polls = 2;

        block_on(r.sd.init()).unwrap();
        assert!(r.sd.is_initialized());
        assert!(r.sd.is_sdhc());
        assert_eq!(r.sd.capacity_blocks(), 15_364 * 1024);
        assert_eq!(r.sd.last_status(), Ok(()));

        // CMD0 -> CMD8 -> (CMD55/ACMD41)+ -> CMD58 -> CMD9, and no CMD16
        // on a sector-addressed card.
        let cmds = r.card.borrow().commands();
        assert_eq!(cmds[0], (0, 0));
        assert_eq!(cmds[1], (8, 0x0000_01AA));
        assert_eq!(cmds[2], (55, 0));
        assert_eq!(cmds[3], (41, 0x4000_0000));
        assert_eq!(cmds.iter().filter(|c| c.0 == 41).count(), 3);
        assert_eq!(cmds.iter().filter(|c| c.0 == 58).count(), 1);
        assert!(cmds.iter().all(|c| c.0 != 16));
        assert_eq!(cmds.last(), Some(&(9, 0)));

        let stats = r.sd.stats();
        assert_eq!(stats.init_attempts, 1);
        assert_eq!(stats.error_count, 0);
    }

    #[test]
    fn sdsc_bring_up_sets_block_length() {
        let r = rig(CardKind::Sdsc, false);

        block_on(r.sd.init()).unwrap();
        assert!(r.sd.is_initialized());
        assert!(!r.sd.is_sdhc());
        assert_eq!(r.sd.capacity_blocks(), 2_097_152);

        let cmds = r.card.borrow().commands();
        assert!(cmds.contains(&(16, 512)));
        // Legacy cards negotiate ACMD41 without the HCS bit.
        assert!(cmds.iter().any(|c| *c == (41, 0)));
        assert!(!cmds.iter().any(|c| c.0 == 41 && c.1 == 0x4000_0000));
    }

    #[test]
    fn init_with_card_absent_never_touches_the_bus() {
        let r = rig(CardKind::Sdhc, false);
        r.present.set(false);

        assert_eq!(block_on(r.sd.init()), Err(SdError::NoMedia));
        assert!(!r.sd.is_initialized());
        assert!(r.card.borrow().trace.is_empty());
        assert_eq!(r.sd.stats().init_attempts, 0);
        assert_eq!(r.sd.last_status(), Err(SdError::NoMedia));
    }

    #[test]
    fn reinit_after_reinsert_reports_the_same_capacity() {
        let r = rig(CardKind::Sdhc, false);
        block_on(r.sd.init()).unwrap();
        let first = r.sd.capacity_blocks();

        r.present.set(false);
        let mut buf = [0u8; 512];
        assert_eq!(
            block_on(r.sd.read_blocks(&mut buf, 0, 1)),
            Err(SdError::NoMedia)
        );
        assert!(!r.sd.is_initialized());

        r.present.set(true);
        r.card.borrow_mut().acmd41_idle_polls = 1;
        block_on(r.sd.init()).unwrap();
        assert_eq!(r.sd.capacity_blocks(), first);
        assert_eq!(r.sd.stats().init_attempts, 2);
    }
}
