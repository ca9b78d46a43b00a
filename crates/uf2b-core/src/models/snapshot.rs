//! Whole-board status snapshots

use serde::Serialize;

use super::status::{StatusCode, DEVICE_CAPACITY};
use crate::error::SnapshotError;

/// Status of every port at one instant
///
/// A snapshot always holds exactly `capacity` codes. It is replaced as a whole
/// whenever the controller answers, never patched in place.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct StatusSnapshot {
    codes: Vec<StatusCode>,
}

impl StatusSnapshot {
    /// All ports in the baseline state
    pub fn unknown(capacity: usize) -> Self {
        Self {
            codes: vec![StatusCode::UNKNOWN; capacity],
        }
    }

    /// Build from raw status bytes
    pub fn from_codes(
        codes: impl Into<Vec<u8>>,
        capacity: usize,
    ) -> Result<Self, SnapshotError> {
        let codes: Vec<u8> = codes.into();
        if codes.len() != capacity {
            return Err(SnapshotError::LengthMismatch {
                expected: capacity,
                actual: codes.len(),
            });
        }
        Ok(Self {
            codes: codes.into_iter().map(StatusCode).collect(),
        })
    }

    /// Build from the integer array the status endpoint returns
    pub fn from_values(values: &[i64], capacity: usize) -> Result<Self, SnapshotError> {
        let codes = values
            .iter()
            .enumerate()
            .map(|(index, &value)| {
                u8::try_from(value).map_err(|_| SnapshotError::ValueOutOfRange { index, value })
            })
            .collect::<Result<Vec<u8>, _>>()?;
        Self::from_codes(codes, capacity)
    }

    /// Number of ports
    pub fn capacity(&self) -> usize {
        self.codes.len()
    }

    /// Status of one port, `None` when the index is out of range
    pub fn get(&self, device: usize) -> Option<StatusCode> {
        self.codes.get(device).copied()
    }

    pub fn codes(&self) -> &[StatusCode] {
        &self.codes
    }

    /// Iterate over `(device, code)` pairs
    pub fn iter(&self) -> impl Iterator<Item = (usize, StatusCode)> + '_ {
        self.codes.iter().copied().enumerate()
    }
}

impl Default for StatusSnapshot {
    fn default() -> Self {
        Self::unknown(DEVICE_CAPACITY)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unknown_snapshot() {
        let snapshot = StatusSnapshot::default();
        assert_eq!(snapshot.capacity(), DEVICE_CAPACITY);
        assert!(snapshot.iter().all(|(_, code)| code == StatusCode::UNKNOWN));
    }

    #[test]
    fn test_length_must_match_capacity() {
        let err = StatusSnapshot::from_codes(vec![0u8; 3], 2).unwrap_err();
        assert_eq!(
            err,
            SnapshotError::LengthMismatch {
                expected: 2,
                actual: 3
            }
        );
    }

    #[test]
    fn test_from_values_rejects_wide_entries() {
        let err = StatusSnapshot::from_values(&[0, 256], 2).unwrap_err();
        assert_eq!(
            err,
            SnapshotError::ValueOutOfRange {
                index: 1,
                value: 256
            }
        );
        assert!(StatusSnapshot::from_values(&[-1, 0], 2).is_err());
    }

    #[test]
    fn test_get_out_of_range() {
        let snapshot = StatusSnapshot::from_codes(vec![0x01, 0x00], 2).unwrap();
        assert_eq!(snapshot.get(0), Some(StatusCode(0x01)));
        assert_eq!(snapshot.get(2), None);
    }
}
