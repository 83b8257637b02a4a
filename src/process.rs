use std::process::Stdio;
use std::time::Duration;

use tokio::process::{Child, Command};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;

use crate::adb::Adb;
use crate::config::Config;
use crate::error::{Result, ScError};
use crate::intr::Intr;

// module name for logging engine
const NAME: &str = "<i><bright-black> process: </>";

const DEVICE_SERVER_PATH: &str = "/data/local/tmp/scrcpy-server.jar";
const SERVER_VERSION: &str = "3.1";
const WATCHDOG: Duration = Duration::from_secs(1);

/// Formats `session_id` as the 8-hex `scid` used both as a command-line key
/// and as the suffix of the remote socket name (§4.F, §9).
pub fn scid_hex(session_id: u32) -> String {
    hex::encode(session_id.to_be_bytes())
}

/// Builds the remote server invocation argv (§4.F), emitting only keys
/// whose value differs from the server-side default so the command line
/// stays short and forward compatible. Order is significant and mirrors the
/// emission order listed in SPEC_FULL §4.F exactly.
pub fn build_argv(
    adb_executable: &str,
    serial: &str,
    config: &Config,
    tunnel_forward: bool,
) -> Vec<String> {
    let mut argv: Vec<String> = vec![
        adb_executable.to_string(),
        "-s".to_string(),
        serial.to_string(),
        "shell".to_string(),
        format!("CLASSPATH={DEVICE_SERVER_PATH}"),
        "app_process".to_string(),
        "/".to_string(),
        "com.genymobile.scrcpy.Server".to_string(),
        SERVER_VERSION.to_string(),
    ];

    let mut params: Vec<String> = Vec::new();

    params.push(format!("scid={}", scid_hex(config.session_id)));
    params.push(format!("log_level={}", config.log_level.server_string()));

    if !config.video_enabled {
        params.push("video=false".to_string());
    }
    if !config.audio_enabled {
        params.push("audio=false".to_string());
    }
    if !config.clipboard_autosync {
        params.push("clipboard_autosync=false".to_string());
    }
    if !config.downsize_on_error {
        params.push("downsize_on_error=false".to_string());
    }
    if !config.cleanup {
        params.push("cleanup=false".to_string());
    }
    if !config.power_on {
        params.push("power_on=false".to_string());
    }
    if config.power_off_on_close {
        params.push("power_off_on_close=true".to_string());
    }

    if config.video_bit_rate != 0 {
        params.push(format!("video_bit_rate={}", config.video_bit_rate));
    }
    if config.audio_bit_rate != 0 {
        params.push(format!("audio_bit_rate={}", config.audio_bit_rate));
    }
    if config.max_size != 0 {
        params.push(format!("max_size={}", config.max_size));
    }
    if config.max_fps != 0 {
        params.push(format!("max_fps={}", config.max_fps));
    }
    if config.lock_video_orientation >= 0 {
        params.push(format!(
            "lock_video_orientation={}",
            config.lock_video_orientation
        ));
    }
    if let Some(crop) = &config.crop {
        params.push(format!("crop={crop}"));
    }

    if config.video_codec.tag() != "h264" {
        params.push(format!("video_codec={}", config.video_codec.tag()));
    }
    if config.audio_codec.tag() != "opus" {
        params.push(format!("audio_codec={}", config.audio_codec.tag()));
    }

    // video_source is checked before display_id/camera_id are considered,
    // preserving the original's guard order when both are set.
    match config.video_source {
        crate::config::VideoSource::Camera => {
            params.push("video_source=camera".to_string());
            if let Some(camera_id) = &config.camera_id {
                params.push(format!("camera_id={camera_id}"));
            }
            if config.camera_position != crate::config::CameraPosition::All {
                params.push(format!(
                    "camera_position={}",
                    camera_position_tag(config.camera_position)
                ));
            }
        }
        crate::config::VideoSource::Display => {
            if config.display_id != 0 {
                params.push(format!("display_id={}", config.display_id));
            }
        }
    }

    if matches!(config.audio_source, crate::config::AudioSource::Mic) {
        params.push("audio_source=mic".to_string());
    }

    if let Some(opts) = &config.video_codec_options {
        params.push(format!("video_codec_options={opts}"));
    }
    if let Some(opts) = &config.audio_codec_options {
        params.push(format!("audio_codec_options={opts}"));
    }
    if let Some(encoder) = &config.video_encoder {
        params.push(format!("video_encoder={encoder}"));
    }
    if let Some(encoder) = &config.audio_encoder {
        params.push(format!("audio_encoder={encoder}"));
    }

    if !config.control_enabled {
        params.push("control=false".to_string());
    }

    if tunnel_forward {
        params.push("tunnel_forward=true".to_string());
    }

    if config.list_encoders {
        params.push("list_encoders=true".to_string());
    }
    if config.list_displays {
        params.push("list_displays=true".to_string());
    }
    if config.list_cameras {
        params.push("list_cameras=true".to_string());
    }

    argv.extend(params);
    argv
}

fn camera_position_tag(position: crate::config::CameraPosition) -> &'static str {
    use crate::config::CameraPosition;
    match position {
        CameraPosition::All => "any",
        CameraPosition::Front => "front",
        CameraPosition::Back => "back",
        CameraPosition::External => "external",
    }
}

/// Pushes the on-device server payload found at `local_payload` to the
/// fixed device-side classpath location (§6 "Payload path resolution").
pub async fn push_payload(adb: &impl Adb, intr: &Intr, serial: &str, local_payload: &str) -> Result<()> {
    adb.push(intr, serial, local_payload, DEVICE_SERVER_PATH).await
}

const INSTALLED_SERVER_PATH: &str = "/usr/local/share/scrcpy/scrcpy-server";

/// Resolves the local server payload path per §6's search order:
/// `SCRCPY_SERVER_PATH` override, then the installed path, then a file next
/// to the running executable, then the current working directory.
pub fn resolve_payload_path() -> Result<String> {
    if let Ok(path) = std::env::var("SCRCPY_SERVER_PATH") {
        return if std::path::Path::new(&path).is_file() {
            Ok(path)
        } else {
            Err(ScError::PayloadMissing(path))
        };
    }

    if std::path::Path::new(INSTALLED_SERVER_PATH).is_file() {
        return Ok(INSTALLED_SERVER_PATH.to_string());
    }

    if let Ok(exe) = std::env::current_exe() {
        if let Some(dir) = exe.parent() {
            let candidate = dir.join("scrcpy-server");
            if candidate.is_file() {
                return Ok(candidate.to_string_lossy().into_owned());
            }
        }
    }

    let cwd_candidate = std::path::Path::new("scrcpy-server");
    if cwd_candidate.is_file() {
        return Ok(cwd_candidate.to_string_lossy().into_owned());
    }

    Err(ScError::PayloadMissing("scrcpy-server".to_string()))
}

/// A spawned remote server process plus its background observer task
/// (component F). `tunnel_forward` argv emission is the tunnel manager's
/// decision, folded into `argv` by the caller before `spawn`.
pub struct RemoteProcess {
    child_pid: Option<u32>,
    observer: ProcessObserver,
}

impl RemoteProcess {
    /// Spawns `argv[0]` with the remaining entries as arguments, inheriting
    /// the host's stdout/stderr exactly like the original shell-exec call.
    pub fn spawn(argv: &[String]) -> Result<Self> {
        let (program, args) = argv.split_first().ok_or(ScError::RemoteSpawnFailed)?;
        let mut cmd = Command::new(program);
        cmd.args(args);
        cmd.stdout(Stdio::inherit());
        cmd.stderr(Stdio::inherit());
        cmd.stdin(Stdio::null());
        cmd.kill_on_drop(false);

        log::info!("{} 🚀 spawning remote server: {:?}", NAME, argv);
        let child = cmd.spawn().map_err(|_| ScError::RemoteSpawnFailed)?;
        let child_pid = child.id();

        let observer = ProcessObserver::spawn(child);
        Ok(Self { child_pid, observer })
    }

    pub fn pid(&self) -> Option<u32> {
        self.child_pid
    }

    /// Returns whether the process exited before `deadline` elapses.
    pub async fn timedwait(&mut self, deadline: Duration) -> bool {
        self.observer.timedwait(deadline).await
    }

    /// Blocks until the process exits, with no deadline. Used both by the
    /// list-query short-circuit (§4.H step 5) and by the early-exit watcher
    /// set up around socket establishment (§4.H step 6, "terminated hook").
    pub async fn wait_for_exit(&mut self) {
        self.observer.wait_for_exit().await
    }

    /// A cloneable handle on the exit flag, so a caller can watch for an
    /// unexpected early exit concurrently with other work without taking
    /// `&mut self` (§4.H: "the terminated hook ... also calls interrupt()").
    pub fn exit_watch(&self) -> watch::Receiver<bool> {
        self.observer.exited.clone()
    }

    /// Sends a graceful `SIGTERM`, then a `SIGKILL` if the process has not
    /// exited by the watchdog deadline (§4.F, §4.H step 8).
    pub async fn terminate(&mut self) {
        self.observer.terminate(self.child_pid).await;
    }

    /// Waits for the observer task to finish reaping the process.
    pub async fn join(self) {
        self.observer.join().await;
    }
}

/// Background waiter for a spawned `Child`: reaps it on a dedicated task and
/// publishes completion through a `watch` channel (rather than a oneshot),
/// so several independent waiters can observe the same exit event (§4.F
/// "Observer").
struct ProcessObserver {
    exited: watch::Receiver<bool>,
    handle: Option<JoinHandle<()>>,
    kill_tx: Option<oneshot::Sender<()>>,
}

impl ProcessObserver {
    fn spawn(mut child: Child) -> Self {
        let (exited_tx, exited_rx) = watch::channel(false);
        let (kill_tx, mut kill_rx) = oneshot::channel::<()>();

        let handle = tokio::spawn(async move {
            tokio::select! {
                _ = child.wait() => {
                    log::debug!("{} remote server terminated", NAME);
                }
                _ = &mut kill_rx => {
                    let _ = child.start_kill();
                    let _ = child.wait().await;
                    log::debug!("{} remote server killed", NAME);
                }
            }
            let _ = exited_tx.send(true);
        });

        Self {
            exited: exited_rx,
            handle: Some(handle),
            kill_tx: Some(kill_tx),
        }
    }

    async fn timedwait(&mut self, deadline: Duration) -> bool {
        if *self.exited.borrow() {
            return true;
        }
        tokio::time::timeout(deadline, self.exited.changed())
            .await
            .is_ok()
    }

    async fn wait_for_exit(&mut self) {
        if *self.exited.borrow() {
            return;
        }
        let _ = self.exited.changed().await;
    }

    async fn terminate(&mut self, pid: Option<u32>) {
        if *self.exited.borrow() {
            return;
        }
        if let Some(pid) = pid {
            use nix::sys::signal::{kill, Signal};
            use nix::unistd::Pid;
            log::info!(
                "{} 🛑 sending SIGTERM to remote server (pid {}), watchdog {}",
                NAME,
                pid,
                humantime::format_duration(WATCHDOG)
            );
            let _ = kill(Pid::from_raw(pid as i32), Signal::SIGTERM);
        }

        if self.timedwait(WATCHDOG).await {
            return;
        }

        log::warn!("{} ⚠️ remote server did not exit in time, sending SIGKILL", NAME);
        if let Some(kill_tx) = self.kill_tx.take() {
            let _ = kill_tx.send(());
        }
        self.timedwait(Duration::from_secs(5)).await;
    }

    async fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}
