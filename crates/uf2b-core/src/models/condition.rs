//! Conditions a flash run waits on

use std::fmt;

use serde::{Deserialize, Serialize};

use super::status::{DeviceState, StatusCode};

/// What a waiter expects a port's status code to become
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum WaitCondition {
    /// Full code equality
    ExactValue(StatusCode),
    /// Lifecycle ordinal at or beyond the threshold
    MinOrdinal(u8),
    /// Every bit of the mask set (mount flags, mask >= 0x20)
    BitmaskSubset(u8),
}

/// Result of checking one code against a condition
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Check {
    /// Not there yet
    Pending,
    /// Condition met by this code
    Satisfied(StatusCode),
    /// The port reported a failure
    Failed(StatusCode),
}

impl WaitCondition {
    /// Wait until the port reaches `state` or any later lifecycle stage
    pub fn reached(state: DeviceState) -> Self {
        Self::MinOrdinal(state.ordinal())
    }

    /// Wait for an exact code
    pub fn exactly(code: impl Into<StatusCode>) -> Self {
        Self::ExactValue(code.into())
    }

    /// Wait until all mount flags in `mask` are set
    pub fn mounted(mask: u8) -> Self {
        Self::BitmaskSubset(mask)
    }

    /// Whether `code` satisfies the condition, ignoring the error flag
    pub fn matches(&self, code: StatusCode) -> bool {
        match *self {
            Self::ExactValue(expected) => code == expected,
            Self::MinOrdinal(threshold) => code.ordinal() >= threshold,
            Self::BitmaskSubset(mask) => code.has_flags(mask),
        }
    }

    /// Evaluate `code`; the error flag always wins over a match
    pub fn check(&self, code: StatusCode) -> Check {
        if code.is_error() {
            Check::Failed(code)
        } else if self.matches(code) {
            Check::Satisfied(code)
        } else {
            Check::Pending
        }
    }
}

impl fmt::Display for WaitCondition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match *self {
            Self::ExactValue(code) => write!(f, "== 0x{:02x}", code.raw()),
            Self::MinOrdinal(threshold) => match DeviceState::from_ordinal(threshold) {
                Some(state) => write!(f, ">= {}", state),
                None => write!(f, ">= ordinal {}", threshold),
            },
            Self::BitmaskSubset(mask) => write!(f, "flags 0x{:02x}", mask),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::status::{MSC_MOUNTED, TUH_MOUNTED};

    #[test]
    fn test_min_ordinal() {
        let cond = WaitCondition::reached(DeviceState::Selected);
        assert_eq!(cond.check(StatusCode(0x00)), Check::Pending);
        assert_eq!(cond.check(StatusCode(0x01)), Check::Satisfied(StatusCode(0x01)));
        // Later stages satisfy earlier thresholds
        assert_eq!(cond.check(StatusCode(0x68)), Check::Satisfied(StatusCode(0x68)));
    }

    #[test]
    fn test_exact_value() {
        let cond = WaitCondition::exactly(DeviceState::Unknown);
        assert_eq!(cond.check(StatusCode(0x00)), Check::Satisfied(StatusCode(0x00)));
        assert_eq!(cond.check(StatusCode(0x01)), Check::Pending);
        assert_eq!(cond.check(StatusCode(0x20)), Check::Pending);
    }

    #[test]
    fn test_bitmask_subset() {
        let cond = WaitCondition::mounted(MSC_MOUNTED);
        assert_eq!(cond.check(StatusCode(0x23)), Check::Pending);
        assert_eq!(cond.check(StatusCode(0x63)), Check::Satisfied(StatusCode(0x63)));

        let both = WaitCondition::mounted(MSC_MOUNTED | TUH_MOUNTED);
        assert_eq!(both.check(StatusCode(0x43)), Check::Pending);
    }

    #[test]
    fn test_error_flag_preempts_match() {
        // 0x13 has ordinal 0x13 >= 2, yet it must be reported as a failure
        let cond = WaitCondition::MinOrdinal(2);
        assert!(cond.matches(StatusCode(0x13)));
        assert_eq!(cond.check(StatusCode(0x13)), Check::Failed(StatusCode(0x13)));

        let exact = WaitCondition::ExactValue(StatusCode(0x10));
        assert_eq!(exact.check(StatusCode(0x10)), Check::Failed(StatusCode(0x10)));
    }

    #[test]
    fn test_display() {
        assert_eq!(
            WaitCondition::reached(DeviceState::FlashRequest).to_string(),
            ">= DEVICE_FLASH_REQUEST"
        );
        assert_eq!(WaitCondition::mounted(0x40).to_string(), "flags 0x40");
    }
}
