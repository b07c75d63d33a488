//! Card-Specific Data decoding. The register is transmitted MSB first; bit
//! 127 is the first byte's top bit.

use crate::config::BLOCK_SIZE;

/// Card capacity in 512-byte blocks, or 0 when the CSD structure version is
/// unknown or the fields do not decode.
pub(crate) fn decode_capacity_blocks(csd: &[u8; 16]) -> u32 {
    match csd_get_bits(csd, 127, 126) {
        1 => {
            // CSD v2.0 (SDHC/SDXC): fixed 512 KiB granularity.
            let c_size = csd_get_bits(csd, 69, 48) as u64;
            let blocks = (c_size + 1) * 1024;
            u32::try_from(blocks).unwrap_or(0)
        }
        0 => {
            // CSD v1.0 (SDSC): capacity in bytes from the size/multiplier
            // fields, then scaled to 512-byte blocks.
            let c_size = csd_get_bits(csd, 73, 62) as u64;
            let c_size_mult = csd_get_bits(csd, 49, 47) as u64;
            let read_bl_len = csd_get_bits(csd, 83, 80);

            let block_len = 1u64 << read_bl_len;
            let mult = 1u64 << (c_size_mult + 2);
            let capacity_bytes = (c_size + 1) * mult * block_len;
            u32::try_from(capacity_bytes / BLOCK_SIZE as u64).unwrap_or(0)
        }
        _ => 0,
    }
}

fn csd_get_bits(csd: &[u8; 16], msb: u8, lsb: u8) -> u32 {
    let mut value = 0u32;
    for bit in (lsb..=msb).rev() {
        let byte_idx = (127 - bit) / 8;
        let bit_in_byte = bit % 8;
        let b = (csd[byte_idx as usize] >> bit_in_byte) & 1;
        value = (value << 1) | b as u32;
    }
    value
}

#[cfg(test)]
mod tests {
    use super::*;

    fn set_bits(csd: &mut [u8; 16], msb: u8, lsb: u8, value: u32) {
        for (offset, bit) in (lsb..=msb).enumerate() {
            let byte_idx = (127 - bit) / 8;
            let bit_in_byte = bit % 8;
            if value >> offset & 1 != 0 {
                csd[byte_idx as usize] |= 1 << bit_in_byte;
            }
        }
    }

    #[test]
    fn v2_capacity_scales_by_1024_blocks() {
        let mut csd = [0u8; 16];
        set_bits(&mut csd, 127, 126, 1);
        // C_SIZE = 15_363 -> 15_364 * 1024 blocks, an 8 GB card.
        set_bits(&mut csd, 69, 48, 15_363);
        assert_eq!(decode_capacity_blocks(&csd), 15_364 * 1024);
    }

    #[test]
    fn v2_field_placement_matches_wire_bytes() {
        // C_SIZE lives in the low bits of byte 7 and all of bytes 8-9.
        let mut csd = [0u8; 16];
        csd[0] = 0x40;
        csd[7] = 0x00;
        csd[8] = 0x3B;
        csd[9] = 0x37;
        assert_eq!(decode_capacity_blocks(&csd), (0x3B37 + 1) * 1024);
    }

    #[test]
    fn v1_capacity_from_size_and_multiplier() {
        let mut csd = [0u8; 16];
        // Structure 0, READ_BL_LEN = 9 (512 B), C_SIZE_MULT = 7,
        // C_SIZE = 4095: (4096 * 512) * 512 B = 1 GB -> 2_097_152 blocks.
        set_bits(&mut csd, 83, 80, 9);
        set_bits(&mut csd, 73, 62, 4095);
        set_bits(&mut csd, 49, 47, 7);
        assert_eq!(decode_capacity_blocks(&csd), 2_097_152);
    }

    #[test]
    fn v1_larger_read_bl_len_scales_bytes() {
        let mut csd = [0u8; 16];
        // READ_BL_LEN = 10 (1024 B blocks on the card, still 512 B sectors
        // at the driver): capacity doubles against the test above.
        set_bits(&mut csd, 83, 80, 10);
        set_bits(&mut csd, 73, 62, 4095);
        set_bits(&mut csd, 49, 47, 7);
        assert_eq!(decode_capacity_blocks(&csd), 2 * 2_097_152);
    }

    #[test]
    fn unknown_structure_reports_zero() {
        let mut csd = [0u8; 16];
        set_bits(&mut csd, 127, 126, 2);
        assert_eq!(decode_capacity_blocks(&csd), 0);
        set_bits(&mut csd, 127, 126, 3);
        assert_eq!(decode_capacity_blocks(&csd), 0);
    }
}
