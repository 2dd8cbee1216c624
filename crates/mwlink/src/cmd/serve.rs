use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::mpsc::RecvTimeoutError;
use std::sync::Arc;
use std::time::Duration;

use mwlink_device::{Device, Snapshot};
use mwlink_session::Server;
use serde::Serialize;
use tracing::info;

use crate::cmd::ServeArgs;
use crate::exit::{session_error, CliError, CliResult, SUCCESS};

#[derive(Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
enum Event<'a> {
    Registered { key: &'a str },
    Update { key: &'a str, snapshot: &'a Snapshot },
}

pub fn run(args: ServeArgs) -> CliResult<i32> {
    let (server, registrations) =
        Server::bind(&args.listen).map_err(|err| session_error("bind failed", err))?;
    let local = server
        .local_addr()
        .map_err(|err| session_error("bind failed", err))?;
    info!(addr = %local, "session manager listening");
    Arc::new(server).spawn();

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    // Devices live as long as the process; their sessions survive
    // transport reconnects.
    let mut devices = Vec::new();
    while running.load(Ordering::SeqCst) {
        match registrations.recv_timeout(Duration::from_millis(200)) {
            Ok(registration) => {
                print_event(&Event::Registered {
                    key: &registration.key,
                });
                let device = Device::new(Arc::clone(&registration.session));
                let key = registration.key.clone();
                device.on_update(move |snapshot| {
                    print_event(&Event::Update {
                        key: key.as_str(),
                        snapshot,
                    });
                });
                devices.push(device);
            }
            Err(RecvTimeoutError::Timeout) => continue,
            Err(RecvTimeoutError::Disconnected) => break,
        }
    }

    Ok(SUCCESS)
}

fn print_event(event: &Event<'_>) {
    println!(
        "{}",
        serde_json::to_string(event).unwrap_or_else(|_| "{}".to_string())
    );
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
