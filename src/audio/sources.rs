//! Input device enumeration
//!
//! Hosts identify devices by a small integer: the 1-based position in the
//! platform's input device list, with 0 meaning "system default".

use super::capture::SourceError;
use crate::config::DEFAULT_INPUT_DEVICE;
use cpal::traits::{DeviceTrait, HostTrait};
use serde::{Deserialize, Serialize};

/// Input device information
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InputDevice {
    /// Id to pass back as `input_device_id`
    pub id: i32,

    /// Display name
    pub name: String,

    /// Whether this is the platform's default input
    pub is_default: bool,

    /// Channels of the default input config (0 if unknown)
    pub channels: u16,

    /// Sample rate of the default input config (0 if unknown)
    pub sample_rate: u32,
}

/// List available input devices on the default host
pub fn list_input_devices() -> Result<Vec<InputDevice>, SourceError> {
    let host = cpal::default_host();
    let default_name = host.default_input_device().and_then(|d| d.name().ok());

    let mut devices = Vec::new();
    for (position, device) in host.input_devices()?.enumerate() {
        let name = match device.name() {
            Ok(name) => name,
            Err(e) => {
                log::debug!("Skipping unnamed input device: {}", e);
                continue;
            }
        };
        let (channels, sample_rate) = device
            .default_input_config()
            .map(|c| (c.channels(), c.sample_rate().0))
            .unwrap_or((0, 0));

        devices.push(InputDevice {
            id: position as i32 + 1,
            is_default: default_name.as_deref() == Some(name.as_str()),
            name,
            channels,
            sample_rate,
        });
    }

    Ok(devices)
}

/// Find the device a host id refers to
pub(crate) fn find_input_device(
    host: &cpal::Host,
    id: i32,
) -> Result<cpal::Device, SourceError> {
    if id == DEFAULT_INPUT_DEVICE {
        return host
            .default_input_device()
            .ok_or_else(|| SourceError::BackendUnavailable("no default input device".into()));
    }
    if id < 0 {
        return Err(SourceError::BackendUnavailable(format!(
            "invalid input device id {}",
            id
        )));
    }

    host.input_devices()?
        .nth(id as usize - 1)
        .ok_or_else(|| SourceError::BackendUnavailable(format!("input device {} not found", id)))
}
