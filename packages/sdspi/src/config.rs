//! Driver tuning constants. All timeouts are wall-clock milliseconds.

/// Logical block size. The SD-SPI protocol below is written for 512-byte
/// sectors; SDSC cards get an explicit SET_BLOCKLEN during bring-up.
pub const BLOCK_SIZE: usize = 512;

/// Bound for a single polled SPI exchange.
pub const SPI_IO_TIMEOUT_MS: u64 = 50;

/// Card-ready wait before a command frame goes out.
pub const CMD_TIMEOUT_MS: u64 = 100;

/// Wait for the 0xFE start token ahead of a data block.
pub const DATA_TOKEN_TIMEOUT_MS: u64 = 200;

/// Wait for the card to release MISO after programming a block.
pub const WRITE_BUSY_TIMEOUT_MS: u64 = 500;

/// Overall bound for each bring-up phase (CMD0 loop, ACMD41 loop).
pub const INIT_TIMEOUT_MS: u64 = 1000;

/// Wait on a DMA completion event before the transfer is aborted.
pub const DMA_TIMEOUT_MS: u64 = 500;

/// Wait to acquire the handle mutex before reporting `Busy`.
pub const MUTEX_TIMEOUT_MS: u64 = 1000;

/// Extra attempts for a failed single-block read or write.
pub const MAX_RETRIES: u32 = 2;

/// Minimum buffer alignment for the DMA path. With a data cache the
/// alignment is a full cache line so maintenance never clips a neighbour.
#[cfg(feature = "dcache")]
pub const DMA_ALIGNMENT: usize = 32;
#[cfg(not(feature = "dcache"))]
pub const DMA_ALIGNMENT: usize = 4;
