//! systemd readiness notifications
//!
//! When the daemon runs as a `Type=notify` unit it reports readiness, a
//! short status line with the number of devices being booted, and shutdown.
//! Outside systemd every call is a no-op.

use anyhow::Result;
use std::env;
use tracing::debug;

/// A sd-notify state change
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ServiceState {
    Ready,
    Stopping,
    Status(String),
}

impl ServiceState {
    fn message(&self) -> String {
        match self {
            Self::Ready => "READY=1".to_string(),
            Self::Stopping => "STOPPING=1".to_string(),
            Self::Status(status) => format!("STATUS={}", status),
        }
    }
}

/// Check if running under systemd
pub fn is_systemd() -> bool {
    env::var_os("NOTIFY_SOCKET").is_some()
}

/// Send a state change to systemd, if it is listening
pub fn notify(state: ServiceState) -> Result<()> {
    let Some(socket_path) = env::var_os("NOTIFY_SOCKET") else {
        debug!("NOTIFY_SOCKET not set, skipping {:?}", state);
        return Ok(());
    };
    send(&socket_path, &state.message())?;
    debug!("Notified systemd: {:?}", state);
    Ok(())
}

#[cfg(unix)]
fn send(socket_path: &std::ffi::OsStr, message: &str) -> Result<()> {
    use anyhow::Context;
    use std::os::unix::net::UnixDatagram;

    let socket = UnixDatagram::unbound().context("Failed to create Unix socket")?;
    socket
        .send_to(message.as_bytes(), socket_path)
        .with_context(|| format!("Failed to send {} to systemd", message))?;
    Ok(())
}

#[cfg(not(unix))]
fn send(_socket_path: &std::ffi::OsStr, _message: &str) -> Result<()> {
    Ok(())
}

/// Status line for `systemctl status`
pub fn devices_status(count: usize) -> ServiceState {
    match count {
        0 => ServiceState::Status("Waiting for devices".to_string()),
        1 => ServiceState::Status("Booting 1 device".to_string()),
        n => ServiceState::Status(format!("Booting {} devices", n)),
    }
}
