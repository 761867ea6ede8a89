//! License validation collaborator.
//!
//! Tables may carry an opaque `license` meta block. The reader does not
//! interpret it; it hands the bytes to a caller-supplied
//! [`LicenseValidator`] and refuses to open the table (as corruption) when
//! the merge fails or the merged state is invalid. Policy lives entirely
//! behind the trait.
//!
//! [`ExpiryLicense`] is the stock validator: the blob is a little-endian
//! `u64` UNIX-seconds expiry, merges keep the earliest expiry seen, and
//! validity is a clock comparison.

#[cfg(test)]
mod tests;

use std::sync::Mutex;
use std::time::{SystemTime, UNIX_EPOCH};

use thiserror::Error;

/// Errors from license handling.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum LicenseError {
    /// The license blob could not be interpreted.
    #[error("malformed license blob")]
    Malformed,
}

/// Caller-provided license merger/validator.
pub trait LicenseValidator: Send + Sync {
    /// Merge a table's license blob into the validator's state.
    fn merge(&self, bytes: &[u8]) -> Result<(), LicenseError>;

    /// Whether the merged state currently permits reads.
    fn valid(&self) -> bool;
}

/// Expiry-timestamp license: valid until the earliest merged deadline.
pub struct ExpiryLicense {
    expires_at: Mutex<Option<u64>>,
}

impl ExpiryLicense {
    /// A validator with no merged deadline yet (valid by default).
    pub fn new() -> Self {
        ExpiryLicense {
            expires_at: Mutex::new(None),
        }
    }

    /// Encode an expiry deadline as a license blob (writer side).
    pub fn encode(expires_at: u64) -> Vec<u8> {
        expires_at.to_le_bytes().to_vec()
    }

    fn now() -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs())
            .unwrap_or(0)
    }
}

impl Default for ExpiryLicense {
    fn default() -> Self {
        Self::new()
    }
}

impl LicenseValidator for ExpiryLicense {
    fn merge(&self, bytes: &[u8]) -> Result<(), LicenseError> {
        if bytes.len() != 8 {
            return Err(LicenseError::Malformed);
        }
        let mut raw = [0u8; 8];
        raw.copy_from_slice(bytes);
        let deadline = u64::from_le_bytes(raw);
        let mut state = self.expires_at.lock().unwrap_or_else(|e| e.into_inner());
        *state = Some(state.map_or(deadline, |d| d.min(deadline)));
        Ok(())
    }

    fn valid(&self) -> bool {
        let state = self.expires_at.lock().unwrap_or_else(|e| e.into_inner());
        state.map_or(true, |deadline| Self::now() <= deadline)
    }
}
