/// Signal handling for graceful shutdown.
///
/// SIGINT (Ctrl-C) or SIGTERM: finish the current iteration, then exit.
/// A second signal while stopping exits immediately.
use crate::watchdog::StopHandle;
use tokio::signal::unix::{signal, SignalKind};

pub fn install(stop: StopHandle) -> std::io::Result<()> {
    let mut sigterm = signal(SignalKind::terminate())?;
    let mut sigint = signal(SignalKind::interrupt())?;

    tokio::spawn(async move {
        let mut received = 0u32;
        loop {
            let name = tokio::select! {
                _ = sigint.recv() => "SIGINT",
                _ = sigterm.recv() => "SIGTERM",
            };
            received += 1;
            if received == 1 {
                tracing::info!(signal = name, "stopping after current iteration");
                stop.graceful_stop();
            } else {
                tracing::warn!(signal = name, "second signal, exiting immediately");
                std::process::exit(130);
            }
        }
    });

    Ok(())
}
