/// Classified failure of a driver operation.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub enum SdError {
    /// Protocol or peripheral failure without a more specific class.
    Error,
    /// A wait-bounded phase ran past its deadline.
    Timeout,
    /// Handle lock unavailable, or the call came from interrupt context.
    Busy,
    /// Invalid argument.
    Param,
    /// Card-detect reports no card.
    NoMedia,
    /// Write data response classified as a CRC fault.
    CrcError,
    /// Write data response classified as a write fault.
    WriteError,
    /// Reserved for capability checks.
    Unsupported,
}

impl SdError {
    pub(crate) fn code(self) -> u8 {
        match self {
            SdError::Error => 1,
            SdError::Timeout => 2,
            SdError::Busy => 3,
            SdError::Param => 4,
            SdError::NoMedia => 5,
            SdError::CrcError => 6,
            SdError::WriteError => 7,
            SdError::Unsupported => 8,
        }
    }

    pub(crate) fn from_code(code: u8) -> Option<SdError> {
        match code {
            1 => Some(SdError::Error),
            2 => Some(SdError::Timeout),
            3 => Some(SdError::Busy),
            4 => Some(SdError::Param),
            5 => Some(SdError::NoMedia),
            6 => Some(SdError::CrcError),
            7 => Some(SdError::WriteError),
            8 => Some(SdError::Unsupported),
            _ => None,
        }
    }
}

/// Snapshot of the driver counters.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "defmt", derive(defmt::Format))]
pub struct SdStats {
    pub read_ops: u32,
    pub write_ops: u32,
    pub read_blocks: u32,
    pub write_blocks: u32,
    pub init_attempts: u32,
    pub error_count: u32,
    pub timeout_count: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn status_codes_round_trip() {
        let all = [
            SdError::Error,
            SdError::Timeout,
            SdError::Busy,
            SdError::Param,
            SdError::NoMedia,
            SdError::CrcError,
            SdError::WriteError,
            SdError::Unsupported,
        ];
        for err in all {
            assert_eq!(SdError::from_code(err.code()), Some(err));
        }
        assert_eq!(SdError::from_code(0), None);
        assert_eq!(SdError::from_code(9), None);
    }
}
