use std::collections::HashMap;
use std::sync::Mutex;

use tracing::debug;

use crate::error::{DeviceError, Result};

/// Tracks which chip channels are leased to client sessions.
///
/// The sharing server registers each chip under an id (typically its serial
/// port path) and leases individual channels to connecting clients. A lease
/// is released when the client's session ends.
#[derive(Default)]
pub struct ChannelManager {
    devices: Mutex<HashMap<String, Vec<bool>>>,
}

impl ChannelManager {
    pub fn new() -> Self {
        ChannelManager::default()
    }

    /// Register a chip with the given number of channels.
    pub fn add(&self, id: &str, channels: usize) -> Result<()> {
        let mut devices = self.devices.lock().unwrap();
        if devices.contains_key(id) {
            return Err(DeviceError::AlreadyRegistered { id: id.to_string() });
        }
        devices.insert(id.to_string(), vec![false; channels]);
        Ok(())
    }

    /// Lease the first free channel on any registered chip.
    pub fn acquire(&self) -> Result<(String, usize)> {
        let mut devices = self.devices.lock().unwrap();
        for (id, channels) in devices.iter_mut() {
            if let Some(index) = channels.iter().position(|used| !used) {
                channels[index] = true;
                debug!(device = %id, channel = index, "channel leased");
                return Ok((id.clone(), index));
            }
        }
        Err(DeviceError::NoFreeChannel)
    }

    /// Return a leased channel.
    pub fn release(&self, id: &str, channel: usize) -> Result<()> {
        let mut devices = self.devices.lock().unwrap();
        let channels = devices.get_mut(id).ok_or_else(|| DeviceError::UnknownDevice {
            id: id.to_string(),
        })?;
        let slot = channels
            .get_mut(channel)
            .ok_or_else(|| DeviceError::InvalidChannel {
                id: id.to_string(),
                channel,
            })?;
        *slot = false;
        debug!(device = %id, channel, "channel released");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn leases_every_channel_then_runs_out() {
        let manager = ChannelManager::new();
        manager.add("/dev/ttyUSB0", 3).unwrap();

        let mut leased: Vec<usize> = (0..3)
            .map(|_| manager.acquire().unwrap())
            .map(|(id, channel)| {
                assert_eq!(id, "/dev/ttyUSB0");
                channel
            })
            .collect();
        leased.sort_unstable();
        assert_eq!(leased, vec![0, 1, 2]);

        assert!(matches!(
            manager.acquire(),
            Err(DeviceError::NoFreeChannel)
        ));
    }

    #[test]
    fn released_channels_are_leased_again() {
        let manager = ChannelManager::new();
        manager.add("chip", 1).unwrap();

        let (id, channel) = manager.acquire().unwrap();
        assert!(matches!(manager.acquire(), Err(DeviceError::NoFreeChannel)));

        manager.release(&id, channel).unwrap();
        assert_eq!(manager.acquire().unwrap(), (id, channel));
    }

    #[test]
    fn release_validates_device_and_channel() {
        let manager = ChannelManager::new();
        manager.add("chip", 1).unwrap();

        assert!(matches!(
            manager.release("other", 0),
            Err(DeviceError::UnknownDevice { .. })
        ));
        assert!(matches!(
            manager.release("chip", 7),
            Err(DeviceError::InvalidChannel { channel: 7, .. })
        ));
    }

    #[test]
    fn duplicate_registration_rejected() {
        let manager = ChannelManager::new();
        manager.add("chip", 3).unwrap();
        assert!(manager.add("chip", 3).is_err());
    }
}
