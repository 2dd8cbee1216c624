use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use mwlink_bridge::{BridgeConfig, LinkBridge};
use mwlink_transport::SerialConfig;
use tracing::info;

use crate::cmd::BridgeArgs;
use crate::exit::{bridge_error, CliError, CliResult, SUCCESS};

pub fn run(args: BridgeArgs) -> CliResult<i32> {
    let serial_config = SerialConfig {
        baud_rate: args.baud,
        ..SerialConfig::default()
    };
    let bridge = LinkBridge::open(
        &args.serial,
        &serial_config,
        &args.connect,
        BridgeConfig::default(),
    )
    .map_err(|err| bridge_error("bridge start failed", err))?;
    info!(serial = %args.serial, remote = %args.connect, "link bridge running");

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;
    while running.load(Ordering::SeqCst) {
        thread::sleep(Duration::from_millis(200));
    }

    bridge.shutdown();
    Ok(SUCCESS)
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| {
        CliError::new(
            crate::exit::INTERNAL,
            format!("signal handler setup failed: {err}"),
        )
    })
}
