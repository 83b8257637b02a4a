use crate::adb::{Adb, DeviceEntry, DeviceState, Transport};
use crate::config::SelectionPolicy;
use crate::error::{Result, ScError};
use crate::intr::Intr;

// module name for logging engine
const NAME: &str = "<i><bright-black> device: </>";

/// Resolves a single target device from the enumerated, eligible set,
/// applying the cardinality rules of §4.D.
pub async fn select_device(
    adb: &impl Adb,
    intr: &Intr,
    policy: &SelectionPolicy,
) -> Result<DeviceEntry> {
    let devices = adb.enumerate_devices(intr).await?;
    let eligible: Vec<DeviceEntry> = devices
        .into_iter()
        .filter(|d| d.state == DeviceState::Device)
        .collect();

    let chosen = match policy {
        SelectionPolicy::BySerial(serial) => {
            let matches: Vec<DeviceEntry> = eligible
                .into_iter()
                .filter(|d| &d.serial == serial)
                .collect();
            match matches.len() {
                0 => return Err(ScError::NoDevice),
                1 => matches.into_iter().next().unwrap(),
                _ => return Err(ScError::AmbiguousDevice(serials(&matches))),
            }
        }
        SelectionPolicy::UsbOnly => {
            let matches: Vec<DeviceEntry> = eligible
                .into_iter()
                .filter(|d| d.transport == Transport::Usb)
                .collect();
            match matches.len() {
                0 => return Err(ScError::NoDevice),
                1 => matches.into_iter().next().unwrap(),
                _ => return Err(ScError::AmbiguousDevice(serials(&matches))),
            }
        }
        SelectionPolicy::TcpipOnly => {
            let matches: Vec<DeviceEntry> = eligible
                .into_iter()
                .filter(|d| d.transport == Transport::Tcpip)
                .collect();
            match matches.len() {
                0 => return Err(ScError::NoDevice),
                1 => matches.into_iter().next().unwrap(),
                _ => return Err(ScError::AmbiguousDevice(serials(&matches))),
            }
        }
        SelectionPolicy::Any => match eligible.len() {
            0 => return Err(ScError::NoDevice),
            1 => eligible.into_iter().next().unwrap(),
            _ => return Err(ScError::AmbiguousDevice(serials(&eligible))),
        },
    };

    log::info!(
        "{} 📱 selected device: <b>{}</b> ({:?})",
        NAME,
        chosen.serial,
        chosen.transport
    );
    Ok(chosen)
}

fn serials(devices: &[DeviceEntry]) -> Vec<String> {
    devices.iter().map(|d| d.serial.clone()).collect()
}
