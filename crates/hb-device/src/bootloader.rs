//! Hosted `Bootloader` implementation for desktop/test builds.
//!
//! A real embedded target would implement [`hb_session::Bootloader`]
//! against MCUboot or a similar bootloader; this implementation models
//! "confirmed" and "pending swap" state as marker files next to the
//! spare slot, the same simulator-over-filesystem approach
//! `rt-eink` uses for its non-hardware backend.

use hb_session::{Bootloader, BootloaderError};
use std::path::PathBuf;

pub struct HostedBootloader {
    confirmed_marker: PathBuf,
    pending_swap_marker: PathBuf,
}

impl HostedBootloader {
    pub fn new(state_dir: &std::path::Path) -> Self {
        HostedBootloader {
            confirmed_marker: state_dir.join("image_confirmed"),
            pending_swap_marker: state_dir.join("pending_swap"),
        }
    }
}

impl Bootloader for HostedBootloader {
    fn is_confirmed(&self) -> Result<bool, BootloaderError> {
        Ok(self.confirmed_marker.exists())
    }

    fn confirm(&self) -> Result<(), BootloaderError> {
        std::fs::write(&self.confirmed_marker, b"confirmed")
            .map_err(|e| BootloaderError::Other(e.to_string()))
    }

    fn erase_bank(&self) -> Result<(), BootloaderError> {
        if self.pending_swap_marker.exists() {
            std::fs::remove_file(&self.pending_swap_marker)
                .map_err(|e| BootloaderError::Other(e.to_string()))?;
        }
        Ok(())
    }

    fn request_swap(&self) -> Result<(), BootloaderError> {
        std::fs::write(&self.pending_swap_marker, b"pending")
            .map_err(|e| BootloaderError::Other(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn starts_unconfirmed_and_can_be_confirmed() {
        let dir = tempfile::tempdir().unwrap();
        let bootloader = HostedBootloader::new(dir.path());
        assert!(!bootloader.is_confirmed().unwrap());
        bootloader.confirm().unwrap();
        assert!(bootloader.is_confirmed().unwrap());
    }

    #[test]
    fn request_swap_then_erase_bank_clears_marker() {
        let dir = tempfile::tempdir().unwrap();
        let bootloader = HostedBootloader::new(dir.path());
        bootloader.request_swap().unwrap();
        assert!(dir.path().join("pending_swap").exists());
        bootloader.erase_bank().unwrap();
        assert!(!dir.path().join("pending_swap").exists());
    }
}
