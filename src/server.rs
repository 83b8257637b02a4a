use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;

use crate::adb::{Adb, AdbFlags, RealAdb};
use crate::config::Config;
use crate::device;
use crate::error::{Result, ScError};
use crate::intr::Intr;
use crate::process::{self, RemoteProcess};
use crate::sockets::{self, RequestedStreams};
use crate::tcpip;
use crate::tunnel::Tunnel;

// module name for logging engine
const NAME: &str = "<i><bright-black> server: </>";

const EXIT_WATCHDOG: Duration = Duration::from_secs(1);
const LIST_QUERY_TIMEOUT: Duration = Duration::from_secs(10);

/// Events delivered to the caller in place of the original's
/// `on_connection_failed`/`on_connected`/`on_disconnected` callbacks (§4.H).
/// Exactly one of `ConnectionFailed` or (`Connected` then `Disconnected`)
/// is ever sent for a given run.
#[derive(Debug, Clone)]
pub enum ControllerEvent {
    Connected { serial: String, device_name: String },
    ConnectionFailed { reason: String },
    Disconnected,
}

/// Orchestrates components A-G as a single background worker (component H).
/// `start()` spawns the worker and returns the receiving half of its event
/// channel; the worker is the sole writer of everything it owns until
/// `stop()`/`join()` hand control back to the caller.
pub struct Controller {
    config: Config,
    intr: Intr,
    worker: Option<JoinHandle<()>>,
}

impl Controller {
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self {
            config,
            intr: Intr::new(),
            worker: None,
        })
    }

    /// Spawns the worker task and returns its event stream. Calling this
    /// more than once replaces any previous worker handle (the caller is
    /// expected to `join()` a run before starting another).
    pub fn start(&mut self) -> mpsc::UnboundedReceiver<ControllerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        let config = self.config.clone();
        let intr = self.intr.clone();
        self.worker = Some(tokio::spawn(run(config, intr, tx)));
        rx
    }

    /// Idempotent, callable from any task holding a clone of this
    /// controller's cancellation handle.
    pub fn stop(&self) {
        self.intr.interrupt();
    }

    /// Waits for the worker to finish. After this returns, every resource
    /// the worker owned (sockets, tunnel, remote process) has been dropped.
    pub async fn join(&mut self) {
        if let Some(handle) = self.worker.take() {
            let _ = handle.await;
        }
    }
}

async fn run(config: Config, intr: Intr, events: mpsc::UnboundedSender<ControllerEvent>) {
    let adb = RealAdb::new();
    if let Err(e) = run_inner(&adb, &config, &intr, &events).await {
        log::error!("{} ❌ connection failed: {}", NAME, e);
        let _ = events.send(ControllerEvent::ConnectionFailed {
            reason: e.to_string(),
        });
    }
}

/// Generic over `&impl Adb` so the whole ten-step path can be driven against
/// `adb::test_support::FakeAdb` in tests, the same way `device.rs`/
/// `tcpip.rs`/`sockets.rs` already are; `run` threads the real adapter in.
async fn run_inner(
    adb: &impl Adb,
    config: &Config,
    intr: &Intr,
    events: &mpsc::UnboundedSender<ControllerEvent>,
) -> Result<()> {
    // Step 1: bridge daemon must be up before anything else can enumerate
    // or push to a device.
    adb.start_daemon(intr).await?;

    // Steps 2-3: resolve the working serial, either via the known-endpoint
    // switcher or via selection (+ optional unknown-endpoint switcher).
    let serial = resolve_serial(adb, intr, config).await?;

    // Step 4: deploy the payload.
    let payload_path = process::resolve_payload_path()?;
    process::push_payload(adb, intr, &serial, &payload_path).await?;

    // Step 5: discovery-only queries short-circuit before any tunnel/socket
    // work, since they never establish a real mirroring session.
    if config.list_requested() {
        return run_list_query(adb, intr, &serial, config, events).await;
    }

    // Step 6: tunnel, remote spawn, socket establishment.
    let remote_socket_name = format!("scrcpy_{}", process::scid_hex(config.session_id));
    let mut tunnel = Tunnel::open(
        adb,
        intr,
        &serial,
        &remote_socket_name,
        config.port_range,
        config.force_forward_tunnel,
    )
    .await?;

    let argv = process::build_argv(adb.executable(), &serial, config, tunnel.forward());
    let mut remote = match RemoteProcess::spawn(&argv) {
        Ok(remote) => remote,
        Err(e) => {
            tunnel.close(adb, intr).await;
            return Err(e);
        }
    };

    let mut exit_rx = remote.exit_watch();
    let watcher = spawn_early_exit_watcher(remote.exit_watch(), intr.clone());

    let requested = RequestedStreams {
        video: config.video_enabled,
        audio: config.audio_enabled,
        control: config.control_enabled,
    };
    let established = sockets::establish(
        &mut tunnel,
        adb,
        intr,
        &serial,
        requested,
        config.tunnel_host.as_deref(),
        config.tunnel_port,
    )
    .await;

    let mut established = match established {
        Ok(established) => established,
        Err(e) => {
            watcher.abort();
            let remote_already_exited = *exit_rx.borrow();
            remote.terminate().await;
            remote.join().await;
            return Err(if matches!(e, ScError::Cancelled) && remote_already_exited {
                ScError::RemoteExitedEarly
            } else {
                e
            });
        }
    };
    // Step 7: signal success, then wait until `stop()` cancels the shared
    // handle or the remote exits on its own (crash, device unplugged). The
    // watcher keeps running across this wait rather than being aborted, and
    // `exit_rx` is raced here directly so the wait does not depend on the
    // watcher task having been scheduled first.
    let _ = events.send(ControllerEvent::Connected {
        serial: serial.clone(),
        device_name: established.device_name.clone(),
    });
    log::info!("{} 🟢 connected to {}", NAME, serial);

    tokio::select! {
        _ = intr.child_token().cancelled() => {}
        _ = exit_rx.changed() => {
            log::warn!("{} ⚠️ remote server exited unexpectedly", NAME);
            intr.interrupt();
        }
    }
    watcher.abort();

    // Step 8: release sockets, then give the remote up to one second to
    // exit on its own before escalating to a forced termination.
    established.video.take();
    established.audio.take();
    established.control.take();

    if !remote.timedwait(EXIT_WATCHDOG).await {
        remote.terminate().await;
    }
    remote.join().await;

    // Step 9: kill the bridge daemon if requested. A fresh handle is used
    // here rather than the (by now, cancelled) `intr`: cancellation is
    // sticky and would otherwise make this deliberate cleanup call fail
    // fast without ever running, see DESIGN.md.
    if config.kill_bridge_on_close {
        let cleanup_intr = Intr::new();
        let _ = adb.kill_daemon(&cleanup_intr, AdbFlags::default()).await;
    }

    // Step 10.
    let _ = events.send(ControllerEvent::Disconnected);
    log::info!("{} 🔴 disconnected", NAME);
    Ok(())
}

async fn resolve_serial(adb: &impl Adb, intr: &Intr, config: &Config) -> Result<String> {
    if let Some(dst) = &config.tcpip_dst {
        return tcpip::switch_known_endpoint(adb, intr, dst).await;
    }

    let policy = config.selection_policy();
    let device = device::select_device(adb, intr, &policy).await?;

    if config.tcpip_enable {
        tcpip::switch_unknown_endpoint(adb, intr, &device).await
    } else {
        Ok(device.serial)
    }
}

async fn run_list_query(
    adb: &impl Adb,
    intr: &Intr,
    serial: &str,
    config: &Config,
    events: &mpsc::UnboundedSender<ControllerEvent>,
) -> Result<()> {
    let argv = process::build_argv(adb.executable(), serial, config, false);
    let mut remote = RemoteProcess::spawn(&argv)?;

    let _ = intr.guard(remote.wait_for_exit()).await;
    if !remote.timedwait(LIST_QUERY_TIMEOUT).await {
        remote.terminate().await;
    }
    remote.join().await;

    let _ = events.send(ControllerEvent::Connected {
        serial: serial.to_string(),
        device_name: String::new(),
    });
    let _ = events.send(ControllerEvent::Disconnected);
    Ok(())
}

/// Watches for the remote process exiting at any point from spawn until the
/// worker reaches its step-8 cleanup, interrupting the shared handle if it
/// does — the async equivalent of the original's "terminated hook also
/// calls interrupt()" so a host-side accept/connect stuck waiting for a dead
/// remote (during establishment) or the step-7 wait (once connected) is
/// released either way (§4.H).
fn spawn_early_exit_watcher(
    mut exit_rx: tokio::sync::watch::Receiver<bool>,
    intr: Intr,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if exit_rx.changed().await.is_ok() && *exit_rx.borrow() {
            log::warn!("{} ⚠️ remote server exited unexpectedly", NAME);
            intr.interrupt();
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::adb::test_support::FakeAdb;
    use crate::adb::{DeviceEntry, DeviceState, Transport};
    use crate::config::Config;
    use std::os::unix::fs::PermissionsExt;
    use tokio::io::AsyncWriteExt;
    use tokio::net::TcpStream;

    #[test]
    fn new_rejects_invalid_config() {
        let config = Config {
            requested_serial: Some("a".to_string()),
            select_usb: true,
            ..Config::default()
        };
        assert!(Controller::new(config).is_err());
    }

    #[test]
    fn new_accepts_default_config() {
        assert!(Controller::new(Config::default()).is_ok());
    }

    #[tokio::test]
    async fn stop_before_start_is_harmless() {
        let controller = Controller::new(Config::default()).unwrap();
        controller.stop();
        controller.stop();
    }

    fn one_device(serial: &str) -> FakeAdb {
        FakeAdb::with_devices(vec![DeviceEntry {
            serial: serial.to_string(),
            state: DeviceState::Device,
            transport: Transport::Usb,
        }])
    }

    /// Writes an executable shell script that ignores its arguments and
    /// sleeps for `sleep_secs`, standing in for a remote server process that
    /// outlives socket establishment without us needing a real `adb`/device.
    fn write_sleep_script(name: &str, sleep_secs: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(name);
        std::fs::write(&path, format!("#!/bin/sh\nsleep {sleep_secs}\n")).unwrap();
        std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o755)).unwrap();
        path
    }

    /// `resolve_payload_path` checks `SCRCPY_SERVER_PATH` before anything
    /// else; point it at a throwaway file so `run_inner` gets past step 4
    /// without a real scrcpy-server payload installed. Returns the path so
    /// the caller can remove it once done.
    fn fake_payload(name: &str) -> std::path::PathBuf {
        let path = std::env::temp_dir().join(name);
        std::fs::write(&path, b"fake payload").unwrap();
        std::env::set_var("SCRCPY_SERVER_PATH", &path);
        path
    }

    #[tokio::test]
    async fn run_inner_fails_fast_when_no_device_is_eligible() {
        let adb = FakeAdb::default();
        let intr = Intr::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let config = Config::default();

        let err = run_inner(&adb, &config, &intr, &tx).await.unwrap_err();
        assert!(matches!(err, ScError::NoDevice));
    }

    #[tokio::test]
    async fn remote_exit_before_handshake_surfaces_as_early_exit() {
        let payload_path = fake_payload("devmirror-ctl-test-server-payload-1");
        let mut adb = one_device("A1B2C3");
        adb.executable = "true".to_string();
        let intr = Intr::new();
        let (tx, _rx) = mpsc::unbounded_channel();
        let config = Config {
            force_forward_tunnel: true,
            audio_enabled: false,
            control_enabled: false,
            port_range: (27893, 27899),
            ..Config::default()
        };

        let result = tokio::time::timeout(
            Duration::from_secs(5),
            run_inner(&adb, &config, &intr, &tx),
        )
        .await
        .expect("run_inner must not hang when the remote exits immediately");

        std::env::remove_var("SCRCPY_SERVER_PATH");
        let _ = std::fs::remove_file(&payload_path);

        assert!(matches!(result, Err(ScError::RemoteExitedEarly)));
    }

    #[tokio::test]
    async fn remote_exit_after_connect_unblocks_the_session_wait() {
        let path = write_sleep_script("devmirror-ctl-test-remote-sleep.sh", "0.3");
        let mut adb = one_device("A1B2C3");
        adb.executable = path.to_string_lossy().into_owned();
        let intr = Intr::new();
        let (tx, mut rx) = mpsc::unbounded_channel();
        let config = Config {
            audio_enabled: false,
            control_enabled: false,
            port_range: (27903, 27903),
            ..Config::default()
        };

        let device_task = tokio::spawn(async move {
            // The tunnel binds its listener before the remote process is
            // even spawned, so a short settle delay is not required for
            // correctness, only to keep the connect attempt from racing an
            // unbound port on a slow CI box.
            tokio::time::sleep(Duration::from_millis(50)).await;
            let mut stream = TcpStream::connect(("127.0.0.1", 27903)).await.unwrap();
            let mut name = [0u8; 64];
            name[..5].copy_from_slice(b"Pixel");
            stream.write_all(&name).await.unwrap();
        });

        let payload_path = fake_payload("devmirror-ctl-test-server-payload-2");

        let result = tokio::time::timeout(Duration::from_secs(5), run_inner(&adb, &config, &intr, &tx))
            .await
            .expect("run_inner must not hang once the remote exits after connecting");

        std::env::remove_var("SCRCPY_SERVER_PATH");
        let _ = std::fs::remove_file(&payload_path);
        device_task.await.unwrap();

        assert!(result.is_ok());
        assert!(matches!(
            rx.recv().await,
            Some(ControllerEvent::Connected { .. })
        ));
        assert!(matches!(rx.recv().await, Some(ControllerEvent::Disconnected)));
    }
}
