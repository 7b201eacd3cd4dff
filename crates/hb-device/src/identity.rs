//! Hosted `DeviceIdentity` implementation.
//!
//! Device id is read from a file (so a fleet of hosted instances can each
//! be given a distinct id); firmware version is the running binary's own
//! `CARGO_PKG_VERSION`.

use hb_session::{DeviceIdentity, IdentityError};
use std::path::PathBuf;

pub struct FileDeviceIdentity {
    device_id_path: PathBuf,
}

impl FileDeviceIdentity {
    pub fn new(device_id_path: PathBuf) -> Self {
        FileDeviceIdentity { device_id_path }
    }
}

impl DeviceIdentity for FileDeviceIdentity {
    fn device_id(&self) -> Result<String, IdentityError> {
        std::fs::read_to_string(&self.device_id_path)
            .map(|s| s.trim().to_owned())
            .map_err(|e| IdentityError::Other(e.to_string()))
    }

    fn firmware_version(&self) -> Result<String, IdentityError> {
        Ok(env!("CARGO_PKG_VERSION").to_owned())
    }
}
