//! Block-device bridge: the five-operation disk contract a FAT layer
//! consumes. Single-card adapter; only drive 0 exists.

use embedded_hal::digital::OutputPin;

use crate::config::BLOCK_SIZE;
use crate::platform::{CardDetect, SpiOps};
use crate::types::SdError;
use crate::SdCard;

/// Disk state bits reported by `status` and `initialize`.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct DiskStatus(u8);

impl DiskStatus {
    pub const READY: DiskStatus = DiskStatus(0);
    pub const NO_INIT: DiskStatus = DiskStatus(0x01);
    pub const NO_DISK: DiskStatus = DiskStatus(0x02);

    pub fn contains(self, bit: DiskStatus) -> bool {
        self.0 & bit.0 != 0
    }

    pub fn is_ready(self) -> bool {
        self.0 == 0
    }

    pub fn bits(self) -> u8 {
        self.0
    }
}

impl core::ops::BitOr for DiskStatus {
    type Output = DiskStatus;

    fn bitor(self, rhs: DiskStatus) -> DiskStatus {
        DiskStatus(self.0 | rhs.0)
    }
}

/// Disk operation failure, mapped from the driver taxonomy.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum DiskError {
    /// Invalid drive, count, or buffer.
    ParamError,
    /// Card absent, not initialized, or the handle is busy.
    NotReady,
    /// Everything else.
    Error,
}

/// Control requests the file-system layer issues besides read and write.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum IoctlCmd {
    /// Flush: wait until the card finished programming.
    Sync,
    /// Capacity in sectors.
    SectorCount,
    /// Sector size in bytes.
    SectorSize,
    /// Erase unit in sectors.
    EraseBlockSize,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum IoctlResponse {
    Synced,
    SectorCount(u32),
    SectorSize(u16),
    EraseBlockSize(u32),
}

/// The single-card disk adapter. Owns a reference to the one driver handle
/// for the life of the mount.
pub struct SdDisk<'a, SPI, CS, CD> {
    card: &'a SdCard<SPI, CS, CD>,
}

impl<'a, SPI: SpiOps, CS: OutputPin, CD: CardDetect> SdDisk<'a, SPI, CS, CD> {
    pub fn new(card: &'a SdCard<SPI, CS, CD>) -> Self {
        Self { card }
    }

    pub fn status(&self, drive: u8) -> DiskStatus {
        if drive != 0 {
            return DiskStatus::NO_INIT;
        }
        if !self.card.is_card_present() {
            return DiskStatus::NO_DISK | DiskStatus::NO_INIT;
        }
        if self.card.is_initialized() {
            DiskStatus::READY
        } else {
            DiskStatus::NO_INIT
        }
    }

    pub async fn initialize(&self, drive: u8) -> DiskStatus {
        if drive != 0 {
            return DiskStatus::NO_INIT;
        }
        if !self.card.is_card_present() {
            return DiskStatus::NO_DISK | DiskStatus::NO_INIT;
        }
        match self.card.init().await {
            Ok(()) => DiskStatus::READY,
            Err(_) => DiskStatus::NO_INIT,
        }
    }

    pub async fn read(
        &self,
        drive: u8,
        buf: &mut [u8],
        sector: u32,
        count: u32,
    ) -> Result<(), DiskError> {
        if drive != 0 || count == 0 || buf.is_empty() {
            return Err(DiskError::ParamError);
        }
        if !self.card.is_initialized() || !self.card.is_card_present() {
            return Err(DiskError::NotReady);
        }
        map_result(self.card.read_blocks(buf, sector, count).await)
    }

    pub async fn write(
        &self,
        drive: u8,
        buf: &[u8],
        sector: u32,
        count: u32,
    ) -> Result<(), DiskError> {
        if drive != 0 || count == 0 || buf.is_empty() {
            return Err(DiskError::ParamError);
        }
        if !self.card.is_initialized() || !self.card.is_card_present() {
            return Err(DiskError::NotReady);
        }
        map_result(self.card.write_blocks(buf, sector, count).await)
    }

    pub async fn ioctl(&self, drive: u8, cmd: IoctlCmd) -> Result<IoctlResponse, DiskError> {
        if drive != 0 {
            return Err(DiskError::ParamError);
        }
        match cmd {
            IoctlCmd::Sync => match self.card.sync().await {
                Ok(()) => Ok(IoctlResponse::Synced),
                Err(_) => Err(DiskError::Error),
            },
            IoctlCmd::SectorSize => Ok(IoctlResponse::SectorSize(BLOCK_SIZE as u16)),
            IoctlCmd::SectorCount => {
                let blocks = self.card.capacity_blocks();
                if blocks > 0 {
                    Ok(IoctlResponse::SectorCount(blocks))
                } else {
                    Err(DiskError::Error)
                }
            }
            IoctlCmd::EraseBlockSize => Ok(IoctlResponse::EraseBlockSize(1)),
        }
    }
}

fn map_result(result: Result<(), SdError>) -> Result<(), DiskError> {
    match result {
        Ok(()) => Ok(()),
        Err(SdError::NoMedia) | Err(SdError::Busy) => Err(DiskError::NotReady),
        Err(SdError::Param) => Err(DiskError::ParamError),
        Err(_) => Err(DiskError::Error),
    }
}

#[cfg(test)]
mod tests {
    use embassy_futures::block_on;

    use super::*;
    use crate::sim::{rig, CardKind};

    #[test]
    fn status_tracks_presence_and_initialization() {
        let r = rig(CardKind::Sdhc, false);
        let disk = SdDisk::new(&r.sd);

        assert_eq!(disk.status(0), DiskStatus::NO_INIT);
        assert_eq!(disk.status(1), DiskStatus::NO_INIT);

        r.present.set(false);
        let status = disk.status(0);
        assert!(status.contains(DiskStatus::NO_DISK));
        assert!(status.contains(DiskStatus::NO_INIT));

        r.present.set(true);
        assert!(block_on(disk.initialize(0)).is_ready());
        assert!(disk.status(0).is_ready());
    }

    #[test]
    fn initialize_refuses_other_drives_and_absent_cards() {
        let r = rig(CardKind::Sdhc, false);
        let disk = SdDisk::new(&r.sd);

        assert_eq!(block_on(disk.initialize(1)), DiskStatus::NO_INIT);

        r.present.set(false);
        let status = block_on(disk.initialize(0));
        assert!(status.contains(DiskStatus::NO_DISK));
        assert!(!r.sd.is_initialized());
    }

    #[test]
    fn read_write_map_driver_statuses() {
        let r = rig(CardKind::Sdhc, false);
        let disk = SdDisk::new(&r.sd);
        let mut buf = [0u8; 512];

        assert_eq!(
            block_on(disk.read(0, &mut buf, 0, 1)),
            Err(DiskError::NotReady)
        );

        assert!(block_on(disk.initialize(0)).is_ready());
        assert_eq!(block_on(disk.read(0, &mut buf, 0, 1)), Ok(()));
        assert_eq!(
            block_on(disk.read(1, &mut buf, 0, 1)),
            Err(DiskError::ParamError)
        );
        assert_eq!(
            block_on(disk.read(0, &mut buf, 0, 0)),
            Err(DiskError::ParamError)
        );
        // Buffer/count mismatch surfaces as a parameter error too.
        assert_eq!(
            block_on(disk.read(0, &mut buf, 0, 2)),
            Err(DiskError::ParamError)
        );
        assert_eq!(block_on(disk.write(0, &buf, 2, 1)), Ok(()));

        r.present.set(false);
        assert_eq!(
            block_on(disk.read(0, &mut buf, 0, 1)),
            Err(DiskError::NotReady)
        );
    }

    #[test]
    fn ioctl_surface_matches_the_disk_contract() {
        let r = rig(CardKind::Sdhc, false);
        let disk = SdDisk::new(&r.sd);

        assert_eq!(
            block_on(disk.ioctl(1, IoctlCmd::Sync)),
            Err(DiskError::ParamError)
        );
        assert_eq!(
            block_on(disk.ioctl(0, IoctlCmd::SectorCount)),
            Err(DiskError::Error)
        );
        assert_eq!(
            block_on(disk.ioctl(0, IoctlCmd::SectorSize)),
            Ok(IoctlResponse::SectorSize(512))
        );
        assert_eq!(
            block_on(disk.ioctl(0, IoctlCmd::EraseBlockSize)),
            Ok(IoctlResponse::EraseBlockSize(1))
        );

        assert!(block_on(disk.initialize(0)).is_ready());
        assert_eq!(
            block_on(disk.ioctl(0, IoctlCmd::SectorCount)),
            Ok(IoctlResponse::SectorCount(15_364 * 1024))
        );
        assert_eq!(
            block_on(disk.ioctl(0, IoctlCmd::Sync)),
            Ok(IoctlResponse::Synced)
        );
    }
}
