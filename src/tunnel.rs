use tokio::net::TcpListener;

use crate::adb::{Adb, AdbFlags};
use crate::error::{Result, ScError};
use crate::intr::Intr;

// module name for logging engine
const NAME: &str = "<i><bright-black> tunnel: </>";

/// The tunnel through which the remote server and the host exchange the
/// video/audio/control streams (component C).
///
/// `server_socket` is `Some` only in reverse mode, matching §3's
/// "`server_socket` present only in reverse mode".
pub struct Tunnel {
    serial: String,
    socket_name: String,
    forward: bool,
    local_port: u16,
    server_socket: Option<TcpListener>,
    closed: bool,
}

impl Tunnel {
    /// Opens a reverse tunnel if possible, falling back to forward when
    /// `force_forward` is set or the reverse attempt fails (§4.C).
    pub async fn open(
        adb: &impl Adb,
        intr: &Intr,
        serial: &str,
        socket_name: &str,
        port_range: (u16, u16),
        force_forward: bool,
    ) -> Result<Self> {
        if !force_forward {
            match Self::try_open_reverse(adb, intr, serial, socket_name, port_range).await {
                Ok(tunnel) => return Ok(tunnel),
                Err(e) => {
                    log::warn!(
                        "{} ⚠️ reverse tunnel failed ({}), falling back to forward",
                        NAME,
                        e
                    );
                }
            }
        }

        Self::open_forward(adb, intr, serial, socket_name, port_range).await
    }

    async fn try_open_reverse(
        adb: &impl Adb,
        intr: &Intr,
        serial: &str,
        socket_name: &str,
        port_range: (u16, u16),
    ) -> Result<Self> {
        let remote = format!("localabstract:{socket_name}");
        let (lo, hi) = port_range;

        for port in lo..=hi {
            let listener = match TcpListener::bind(("127.0.0.1", port)).await {
                Ok(listener) => listener,
                Err(_) => continue,
            };

            let local = format!("tcp:{port}");
            match adb.reverse(intr, serial, &remote, &local).await {
                Ok(()) => {
                    log::info!("{} 🔁 reverse tunnel opened on port {}", NAME, port);
                    return Ok(Self {
                        serial: serial.to_string(),
                        socket_name: socket_name.to_string(),
                        forward: false,
                        local_port: port,
                        server_socket: Some(listener),
                        closed: false,
                    });
                }
                Err(_) => continue,
            }
        }

        Err(ScError::TunnelSetupFailed(format!(
            "no free port in range {lo}..={hi} accepted a reverse mapping"
        )))
    }

    async fn open_forward(
        adb: &impl Adb,
        intr: &Intr,
        serial: &str,
        socket_name: &str,
        port_range: (u16, u16),
    ) -> Result<Self> {
        let remote = format!("localabstract:{socket_name}");
        let (lo, hi) = port_range;

        for port in lo..=hi {
            let local = format!("tcp:{port}");
            if adb.forward(intr, serial, &local, &remote).await.is_ok() {
                log::info!("{} ➡️ forward tunnel opened on port {}", NAME, port);
                return Ok(Self {
                    serial: serial.to_string(),
                    socket_name: socket_name.to_string(),
                    forward: true,
                    local_port: port,
                    server_socket: None,
                    closed: false,
                });
            }
        }

        Err(ScError::TunnelSetupFailed(format!(
            "no free port in range {lo}..={hi} accepted a forward mapping"
        )))
    }

    pub fn forward(&self) -> bool {
        self.forward
    }

    pub fn local_port(&self) -> u16 {
        self.local_port
    }

    pub fn server_socket(&self) -> Option<&TcpListener> {
        self.server_socket.as_ref()
    }

    /// Removes the bridge mapping and drops the host listener, if any.
    /// Idempotent: a second call is a no-op.
    pub async fn close(&mut self, adb: &impl Adb, intr: &Intr) {
        if self.closed {
            return;
        }
        self.closed = true;

        let remote = format!("localabstract:{}", self.socket_name);
        if self.forward {
            let local = format!("tcp:{}", self.local_port);
            let _ = adb.forward_remove(intr, &self.serial, &local).await;
        } else {
            let _ = adb.reverse_remove(intr, &self.serial, &remote).await;
        }
        self.server_socket = None;
        log::debug!("{} tunnel closed", NAME);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adb::test_support::FakeAdb;

    #[tokio::test]
    async fn reverse_tunnel_picks_first_free_port() {
        let adb = FakeAdb::default();
        let intr = Intr::new();
        let tunnel = Tunnel::open(&adb, &intr, "A1B2C3", "scrcpy_0a1b2c3d", (27183, 27199), false)
            .await
            .unwrap();
        assert!(!tunnel.forward());
        assert_eq!(tunnel.local_port(), 27183);
        assert!(tunnel.server_socket().is_some());
    }

    #[tokio::test]
    async fn forced_forward_skips_reverse_attempt() {
        let adb = FakeAdb::default();
        let intr = Intr::new();
        let tunnel = Tunnel::open(&adb, &intr, "A1B2C3", "scrcpy_0a1b2c3d", (27183, 27199), true)
            .await
            .unwrap();
        assert!(tunnel.forward());
        assert!(tunnel.server_socket().is_none());
    }

    // Each test below uses a disjoint port range so concurrently-running
    // tests never race each other for the same local port.

    #[tokio::test]
    async fn reverse_tunnel_skips_ports_already_bound() {
        let adb = FakeAdb::default();
        let intr = Intr::new();
        // Occupy the first port in range ourselves.
        let _held = TcpListener::bind(("127.0.0.1", 27283)).await.unwrap();

        let tunnel = Tunnel::open(&adb, &intr, "A1B2C3", "scrcpy_0a1b2c3d", (27283, 27290), false)
            .await
            .unwrap();
        assert_eq!(tunnel.local_port(), 27284);
    }

    #[tokio::test]
    async fn single_port_in_use_fails_tunnel_setup() {
        let adb = FakeAdb::default();
        let intr = Intr::new();
        let _held = TcpListener::bind(("127.0.0.1", 27383)).await.unwrap();

        let err = Tunnel::open(&adb, &intr, "A1B2C3", "scrcpy_0a1b2c3d", (27383, 27383), false)
            .await
            .unwrap_err();
        assert!(matches!(err, ScError::TunnelSetupFailed(_)));
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let adb = FakeAdb::default();
        let intr = Intr::new();
        let mut tunnel = Tunnel::open(&adb, &intr, "A1B2C3", "scrcpy_0a1b2c3d", (27483, 27490), false)
            .await
            .unwrap();
        tunnel.close(&adb, &intr).await;
        tunnel.close(&adb, &intr).await;
        assert!(tunnel.server_socket().is_none());
    }
}
