use std::time::Duration;

use crate::adb::{Adb, AdbFlags, DeviceEntry, Transport};
use crate::error::{Result, ScError};
use crate::intr::Intr;

// module name for logging engine
const NAME: &str = "<i><bright-black> tcpip: </>";

const DEFAULT_PORT: u16 = 5555;
const POLL_ATTEMPTS: usize = 40;
const POLL_DELAY: Duration = Duration::from_millis(250);

/// Known-endpoint switcher (§4.E "Known endpoint"). Normalizes `addr` to
/// `HOST:PORT`, disconnects silently, connects, and returns the resolved
/// serial.
pub async fn switch_known_endpoint(adb: &impl Adb, intr: &Intr, addr: &str) -> Result<String> {
    let ip_port = if addr.contains(':') {
        addr.to_string()
    } else {
        format!("{addr}:{DEFAULT_PORT}")
    };

    // Error expected if not connected; ignored by design.
    adb.disconnect(intr, &ip_port, AdbFlags::SILENT).await?;

    log::info!("{} 🔗 connecting to {}...", NAME, ip_port);
    adb.connect(intr, &ip_port, AdbFlags::default())
        .await
        .map_err(|_| ScError::TcpipSetupFailed {
            serial: ip_port.clone(),
            reason: "connect failed".to_string(),
        })?;
    log::info!("{} ✅ connected to {}", NAME, ip_port);

    Ok(ip_port)
}

/// Unknown-endpoint switcher (§4.E "Unknown endpoint"). Adopts the device's
/// serial verbatim if it is already TCP/IP, otherwise enables TCP/IP mode,
/// polls until it takes effect, then connects.
pub async fn switch_unknown_endpoint(
    adb: &impl Adb,
    intr: &Intr,
    device: &DeviceEntry,
) -> Result<String> {
    if device.transport == Transport::Tcpip {
        log::info!(
            "{} 📡 device already connected via TCP/IP: {}",
            NAME,
            device.serial
        );
        return Ok(device.serial.clone());
    }

    let serial = &device.serial;
    log::info!("{} 🔀 switching device {} to TCP/IP...", NAME, serial);

    let ip = adb.get_device_ip(intr, serial).await?;

    let current_port = get_adb_tcp_port(adb, intr, serial).await;
    let port = if current_port == DEFAULT_PORT {
        log::info!(
            "{} 📡 TCP/IP mode already enabled on port {}",
            NAME,
            DEFAULT_PORT
        );
        DEFAULT_PORT
    } else {
        adb.tcpip(intr, serial, DEFAULT_PORT, AdbFlags::SILENT)
            .await
            .map_err(|_| ScError::TcpipSetupFailed {
                serial: serial.clone(),
                reason: "could not restart adbd in TCP/IP mode".to_string(),
            })?;

        wait_tcpip_mode_enabled(adb, intr, serial, DEFAULT_PORT).await?;
        log::info!("{} 📡 TCP/IP mode enabled on port {}", NAME, DEFAULT_PORT);
        DEFAULT_PORT
    };

    let ip_port = format!("{ip}:{port}");

    // Error expected if not connected; ignored by design.
    adb.disconnect(intr, &ip_port, AdbFlags::SILENT).await?;

    log::info!("{} 🔗 connecting to {}...", NAME, ip_port);
    adb.connect(intr, &ip_port, AdbFlags::default())
        .await
        .map_err(|_| ScError::TcpipSetupFailed {
            serial: ip_port.clone(),
            reason: "connect failed".to_string(),
        })?;
    log::info!("{} ✅ connected to {}", NAME, ip_port);

    Ok(ip_port)
}

async fn get_adb_tcp_port(adb: &impl Adb, intr: &Intr, serial: &str) -> u16 {
    let Ok(value) = adb
        .getprop(intr, serial, "service.adb.tcp.port", AdbFlags::SILENT)
        .await
    else {
        return 0;
    };
    value.trim().parse::<u16>().unwrap_or(0)
}

/// Polls `service.adb.tcp.port` until it reports `expected_port`, up to
/// `POLL_ATTEMPTS` tries at `POLL_DELAY` cadence. Each sleep is raced
/// against the shared cancellation token directly (rather than through
/// `Intr::guard`, which would swallow the distinction between "woke up
/// normally" and "woke up because of cancellation") so `stop()` aborts the
/// poll immediately instead of waiting out the current delay (§4.E step 3).
async fn wait_tcpip_mode_enabled(
    adb: &impl Adb,
    intr: &Intr,
    serial: &str,
    expected_port: u16,
) -> Result<()> {
    log::info!("{} ⏳ waiting for TCP/IP mode enabled...", NAME);

    let cancelled = intr.child_token();
    for attempt in 1..=POLL_ATTEMPTS {
        tokio::select! {
            biased;
            _ = cancelled.cancelled() => {
                log::info!("{} TCP/IP mode waiting interrupted", NAME);
                return Err(ScError::Cancelled);
            }
            _ = tokio::time::sleep(POLL_DELAY) => {}
        }

        let port = get_adb_tcp_port(adb, intr, serial).await;
        if port == expected_port {
            return Ok(());
        }
        log::debug!("{} poll attempt {}/{}: not yet enabled", NAME, attempt, POLL_ATTEMPTS);
    }

    Err(ScError::TcpipSetupFailed {
        serial: serial.to_string(),
        reason: format!("TCP/IP mode not enabled after {POLL_ATTEMPTS} attempts"),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adb::{DeviceState, Transport};
    use crate::adb::test_support::FakeAdb;

    fn device(serial: &str, transport: Transport) -> DeviceEntry {
        DeviceEntry {
            serial: serial.to_string(),
            state: DeviceState::Device,
            transport,
        }
    }

    #[tokio::test]
    async fn already_tcpip_device_adopts_serial_verbatim() {
        let adb = FakeAdb::default();
        let intr = Intr::new();
        let dev = device("192.168.1.7:5555", Transport::Tcpip);
        let serial = switch_unknown_endpoint(&adb, &intr, &dev).await.unwrap();
        assert_eq!(serial, "192.168.1.7:5555");
    }

    #[tokio::test]
    async fn known_endpoint_appends_default_port() {
        let adb = FakeAdb::default();
        let intr = Intr::new();
        let serial = switch_known_endpoint(&adb, &intr, "10.0.0.5").await.unwrap();
        assert_eq!(serial, "10.0.0.5:5555");
        assert_eq!(adb.connect_calls.lock().unwrap().as_slice(), ["10.0.0.5:5555"]);
    }

    #[tokio::test]
    async fn known_endpoint_preserves_explicit_port() {
        let adb = FakeAdb::default();
        let intr = Intr::new();
        let serial = switch_known_endpoint(&adb, &intr, "10.0.0.5:5037")
            .await
            .unwrap();
        assert_eq!(serial, "10.0.0.5:5037");
    }

    #[tokio::test]
    async fn unknown_endpoint_switches_usb_device_to_tcpip() {
        let mut adb = FakeAdb::with_devices(vec![]);
        adb.device_ip = Some("192.168.1.7".to_string());
        adb.queue_prop("A1B2C3", "service.adb.tcp.port", vec!["", "", "5555"]);
        let intr = Intr::new();
        let dev = device("A1B2C3", Transport::Usb);

        let serial = switch_unknown_endpoint(&adb, &intr, &dev).await.unwrap();
        assert_eq!(serial, "192.168.1.7:5555");
        assert_eq!(adb.tcpip_calls.lock().unwrap().as_slice(), [("A1B2C3".to_string(), 5555)]);
    }

    #[tokio::test]
    async fn unknown_endpoint_skips_enable_when_already_5555() {
        let mut adb = FakeAdb::with_devices(vec![]);
        adb.device_ip = Some("192.168.1.7".to_string());
        adb.queue_prop("A1B2C3", "service.adb.tcp.port", vec!["5555"]);
        let intr = Intr::new();
        let dev = device("A1B2C3", Transport::Usb);

        switch_unknown_endpoint(&adb, &intr, &dev).await.unwrap();
        assert!(adb.tcpip_calls.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn poll_stops_promptly_on_interrupt() {
        let mut adb = FakeAdb::with_devices(vec![]);
        adb.queue_prop("A1B2C3", "service.adb.tcp.port", vec![""; 50]);
        let intr = Intr::new();
        intr.interrupt();

        let err = wait_tcpip_mode_enabled(&adb, &intr, "A1B2C3", 5555)
            .await
            .unwrap_err();
        assert!(matches!(err, ScError::Cancelled));
    }
}
