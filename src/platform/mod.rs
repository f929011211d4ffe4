//! Platform-scoped side effects: TCP fast open and the system proxy
//! setting.

use std::net::SocketAddr;

use socket2::Socket;
use tracing::{debug, warn};

use crate::error::ListenError;

/// Pending-SYN queue length passed to `TCP_FASTOPEN`
const FAST_OPEN_QUEUE: libc::c_int = 256;

/// Enable TCP fast open on a not-yet-listening socket.
///
/// Fails with [`ListenError::FastOpenUnsupported`] on platforms without
/// the option; the caller treats that as fatal because fast open was
/// explicitly requested.
#[cfg(target_os = "linux")]
pub fn enable_tcp_fast_open(socket: &Socket) -> Result<(), ListenError> {
    use std::os::unix::io::AsRawFd;

    let fd = socket.as_raw_fd();
    let queue = FAST_OPEN_QUEUE;
    // Not exposed by socket2 for listeners, set via raw setsockopt
    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_FASTOPEN,
            std::ptr::addr_of!(queue).cast::<libc::c_void>(),
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };
    if ret != 0 {
        return Err(ListenError::socket_option(
            "TCP_FASTOPEN",
            std::io::Error::last_os_error(),
        ));
    }
    debug!("tcp fast open enabled (queue={FAST_OPEN_QUEUE})");
    Ok(())
}

#[cfg(not(target_os = "linux"))]
pub fn enable_tcp_fast_open(_socket: &Socket) -> Result<(), ListenError> {
    Err(ListenError::FastOpenUnsupported)
}

/// Undo action captured when the system proxy is installed.
///
/// Invoked exactly once at inbound close; holds whatever state the
/// platform needs to restore the previous configuration.
pub struct SystemProxyGuard {
    previous_mode: String,
    cleared: bool,
}

impl SystemProxyGuard {
    /// Restore the previous system proxy configuration
    pub fn clear(mut self) -> Result<(), ListenError> {
        self.cleared = true;
        clear_system_proxy(&self.previous_mode)
    }
}

impl Drop for SystemProxyGuard {
    fn drop(&mut self) {
        if !self.cleared {
            if let Err(e) = clear_system_proxy(&self.previous_mode) {
                warn!("failed to clear system proxy: {e}");
            }
        }
    }
}

/// Point the desktop environment's proxy settings at the given local
/// listener. Returns the undo guard to invoke at close.
#[cfg(target_os = "linux")]
pub fn set_system_proxy(listen: SocketAddr, mixed: bool) -> Result<SystemProxyGuard, ListenError> {
    let previous_mode = gsettings_get("org.gnome.system.proxy", "mode")
        .unwrap_or_else(|_| "'none'".into());

    let host = listen.ip().to_string();
    let port = listen.port().to_string();

    gsettings_set("org.gnome.system.proxy", "mode", "'manual'")?;
    gsettings_set("org.gnome.system.proxy.http", "host", &host)?;
    gsettings_set("org.gnome.system.proxy.http", "port", &port)?;
    gsettings_set("org.gnome.system.proxy.https", "host", &host)?;
    gsettings_set("org.gnome.system.proxy.https", "port", &port)?;
    if mixed {
        gsettings_set("org.gnome.system.proxy.socks", "host", &host)?;
        gsettings_set("org.gnome.system.proxy.socks", "port", &port)?;
    }

    debug!(%listen, "system proxy installed");
    Ok(SystemProxyGuard {
        previous_mode,
        cleared: false,
    })
}

#[cfg(not(target_os = "linux"))]
pub fn set_system_proxy(
    _listen: SocketAddr,
    _mixed: bool,
) -> Result<SystemProxyGuard, ListenError> {
    Err(ListenError::SystemProxy(
        "not supported on this platform".into(),
    ))
}

#[cfg(target_os = "linux")]
fn clear_system_proxy(previous_mode: &str) -> Result<(), ListenError> {
    gsettings_set("org.gnome.system.proxy", "mode", previous_mode)
}

#[cfg(not(target_os = "linux"))]
fn clear_system_proxy(_previous_mode: &str) -> Result<(), ListenError> {
    Ok(())
}

#[cfg(target_os = "linux")]
fn gsettings_get(schema: &str, key: &str) -> Result<String, ListenError> {
    let output = std::process::Command::new("gsettings")
        .args(["get", schema, key])
        .output()
        .map_err(|e| ListenError::SystemProxy(e.to_string()))?;
    if !output.status.success() {
        return Err(ListenError::SystemProxy(format!(
            "gsettings get {schema} {key} failed"
        )));
    }
    Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
}

#[cfg(target_os = "linux")]
fn gsettings_set(schema: &str, key: &str, value: &str) -> Result<(), ListenError> {
    let status = std::process::Command::new("gsettings")
        .args(["set", schema, key, value])
        .status()
        .map_err(|e| ListenError::SystemProxy(e.to_string()))?;
    if !status.success() {
        return Err(ListenError::SystemProxy(format!(
            "gsettings set {schema} {key} failed"
        )));
    }
    Ok(())
}
