use std::sync::Arc;

use ambe_api::Api;
use ambe_device::{Device, DeviceUri, UartDevice};
use ambe_remote::RemoteDevice;
use ambe_sched::{FifoScheduler, MultiQueueScheduler, Scheduler};
use tracing::warn;

use crate::exit::{device_error, scheduler_error, CliResult};

/// A started device with its scheduler and API, opened from a URI.
///
/// `usb:` URIs get the multi-queue scheduler over the local UART; `tcp:`
/// URIs get the FIFO scheduler over a remote session with one leased
/// channel.
pub struct Connection {
    pub api: Api,
    channels: usize,
    leased_channel: Option<u8>,
    local: bool,
    scheduler: Arc<dyn Scheduler>,
    device: Arc<dyn Device>,
}

impl Connection {
    pub fn open(uri: &str) -> CliResult<Connection> {
        match DeviceUri::parse(uri).map_err(|err| device_error("parse URI", err))? {
            DeviceUri::Usb { path } => {
                let device = Arc::new(UartDevice::usb3003(&path));
                device
                    .start()
                    .map_err(|err| device_error("open serial device", err))?;

                let scheduler = match MultiQueueScheduler::new(device.clone(), device.channels())
                {
                    Ok(scheduler) => Arc::new(scheduler),
                    Err(err) => {
                        let _ = device.stop();
                        return Err(scheduler_error("create scheduler", err));
                    }
                };
                if let Err(err) = scheduler.start() {
                    let _ = device.stop();
                    return Err(scheduler_error("start scheduler", err));
                }

                let api = Api::over_fifo(device.clone(), scheduler.clone());
                Ok(Connection {
                    api,
                    channels: device.channels(),
                    leased_channel: None,
                    local: true,
                    scheduler,
                    device,
                })
            }
            DeviceUri::Tcp { authority } => {
                let device = Arc::new(RemoteDevice::new(authority));
                device
                    .start()
                    .map_err(|err| device_error("connect to server", err))?;

                let scheduler = Arc::new(FifoScheduler::new(device.clone()));
                if let Err(err) = scheduler.start() {
                    let _ = device.stop();
                    return Err(scheduler_error("start scheduler", err));
                }

                let leased = device.channel();
                let api = Api::over_tagged(device.clone(), scheduler.clone());
                Ok(Connection {
                    api,
                    channels: 1,
                    leased_channel: leased,
                    local: false,
                    scheduler,
                    device,
                })
            }
        }
    }

    /// Number of chip channels this connection may use.
    pub fn channels(&self) -> usize {
        self.channels
    }

    /// Whether the chip hangs off a local serial port.
    pub fn is_local(&self) -> bool {
        self.local
    }

    /// Map a 0-based slot to the chip channel to address: local connections
    /// own all channels, remote sessions only their leased one.
    pub fn channel_id(&self, slot: usize) -> u8 {
        self.leased_channel.unwrap_or(slot as u8)
    }

    /// Stop the scheduler (draining in-flight requests) and the device.
    /// Teardown failures are logged, never fatal.
    pub fn close(self) {
        if let Err(err) = self.scheduler.stop() {
            warn!(error = %err, "scheduler stop failed");
        }
        if let Err(err) = self.device.stop() {
            warn!(error = %err, "device stop failed");
        }
    }
}
