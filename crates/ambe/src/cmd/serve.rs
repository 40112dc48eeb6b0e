use std::net::TcpListener;
use std::sync::Arc;

use ambe_api::Api;
use ambe_device::{Device, UartDevice};
use ambe_remote::{serve, SharedChip};
use ambe_sched::{MultiQueueScheduler, Scheduler};
use tracing::info;

use crate::cmd::ServeArgs;
use crate::exit::{api_error, device_error, io_error, scheduler_error, CliError, CliResult};

pub fn run(args: ServeArgs) -> CliResult<i32> {
    let device = Arc::new(UartDevice::usb3003(&args.serial));
    device
        .start()
        .map_err(|err| device_error("open serial device", err))?;

    let scheduler = Arc::new(
        MultiQueueScheduler::new(device.clone(), device.channels())
            .map_err(|err| scheduler_error("create scheduler", err))?,
    );
    scheduler
        .start()
        .map_err(|err| scheduler_error("start scheduler", err))?;

    init_chip(&args.serial, device.clone(), scheduler.clone())?;

    let chip = Arc::new(
        SharedChip::new(
            &args.serial,
            scheduler.clone() as Arc<dyn Scheduler>,
            device.parity(),
            device.channels(),
        )
        .map_err(|err| device_error("register chip", err))?,
    );

    // Drain the chip and release the serial port on ctrl-c.
    {
        let scheduler = scheduler.clone();
        let device = device.clone();
        ctrlc::set_handler(move || {
            info!("shutting down");
            let _ = scheduler.stop();
            let _ = device.stop();
            std::process::exit(crate::exit::SUCCESS);
        })
        .map_err(|err| CliError::new(crate::exit::INTERNAL, format!("signal handler: {err}")))?;
    }

    let listener = TcpListener::bind(&args.listen).map_err(|err| io_error("bind", err))?;
    serve(listener, chip).map_err(|err| io_error("serve", err))?;
    Ok(crate::exit::SUCCESS)
}

/// Chip bring-up: hardware reset, identify, then disable the per-packet
/// parity and companding that clients do not expect.
fn init_chip(
    id: &str,
    device: Arc<UartDevice>,
    scheduler: Arc<MultiQueueScheduler>,
) -> CliResult<()> {
    let api = Api::over_fifo(device, scheduler);

    info!(chip = %id, "resetting AMBE chip");
    api.reset(true).map_err(|err| api_error("reset", err))?;

    let prodid = api.prodid().map_err(|err| api_error("prodid", err))?;
    let version = api.verstring().map_err(|err| api_error("verstring", err))?;
    info!(chip = %id, %prodid, %version, "found AMBE chip");

    info!(chip = %id, "disabling parity");
    api.parity_mode(false)
        .map_err(|err| api_error("disable parity", err))?;

    info!(chip = %id, "disabling companding");
    api.compand(false, false)
        .map_err(|err| api_error("disable companding", err))?;

    Ok(())
}
