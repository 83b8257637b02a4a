use clap::Parser;
use simplelog::{ColorChoice, ConfigBuilder, LevelFilter, TermLogger, TerminalMode};

use devmirror_ctl::config::{Config, LogLevel};
use devmirror_ctl::{Controller, ControllerEvent};

/// Thin demo binary driving the device server controller end to end; the
/// real controller logic lives in the library crate, this is wiring only.
#[derive(Parser, Debug)]
#[command(name = "devmirror-ctl", about = "Bring up and supervise a mirrored device server")]
struct Cli {
    /// Select a specific device by serial, rather than the sole connected one.
    #[arg(long)]
    serial: Option<String>,

    /// Restrict selection to a USB-attached device.
    #[arg(long, conflicts_with_all = ["serial", "tcpip"])]
    usb: bool,

    /// Restrict selection to a TCP/IP-attached device.
    #[arg(long, conflicts_with_all = ["serial", "usb"])]
    tcpip: bool,

    /// Connect to a known TCP/IP endpoint (`HOST` or `HOST:PORT`).
    #[arg(long)]
    tcpip_dst: Option<String>,

    /// Switch the selected USB device to TCP/IP mode before connecting.
    #[arg(long)]
    tcpip_enable: bool,

    /// Disable the video stream.
    #[arg(long)]
    no_video: bool,

    /// Disable the audio stream.
    #[arg(long)]
    no_audio: bool,

    /// Disable the control stream.
    #[arg(long)]
    no_control: bool,

    /// Force a forward tunnel instead of trying reverse first.
    #[arg(long)]
    force_forward: bool,

    /// Low end of the local tunnel port range.
    #[arg(long, default_value_t = 27183)]
    port_range_lo: u16,

    /// High end of the local tunnel port range.
    #[arg(long, default_value_t = 27199)]
    port_range_hi: u16,

    /// Kill the bridge daemon once the session ends.
    #[arg(long)]
    kill_bridge_on_close: bool,

    /// Verbosity passed through to both the host logger and the remote
    /// server's own `log_level`.
    #[arg(long, default_value = "info")]
    log_level: String,
}

impl Cli {
    fn into_config(self) -> anyhow::Result<Config> {
        let log_level = match self.log_level.as_str() {
            "verbose" => LogLevel::Verbose,
            "debug" => LogLevel::Debug,
            "info" => LogLevel::Info,
            "warn" => LogLevel::Warn,
            "error" => LogLevel::Error,
            other => anyhow::bail!("unknown log level: {other}"),
        };

        Ok(Config {
            session_id: rand_session_id(),
            requested_serial: self.serial,
            select_usb: self.usb,
            select_tcpip: self.tcpip,
            tcpip_enable: self.tcpip_enable || self.tcpip_dst.is_some(),
            tcpip_dst: self.tcpip_dst,

            video_enabled: !self.no_video,
            audio_enabled: !self.no_audio,
            control_enabled: !self.no_control,

            force_forward_tunnel: self.force_forward,
            port_range: (self.port_range_lo, self.port_range_hi),

            kill_bridge_on_close: self.kill_bridge_on_close,
            log_level,

            ..Config::default()
        })
    }
}

/// `session_id` only needs to be distinct across concurrent runs against the
/// same device; process id mixed with a fixed salt is good enough here
/// without pulling in a random-number crate the teacher's stack doesn't use.
fn rand_session_id() -> u32 {
    std::process::id().wrapping_mul(2_654_435_761)
}

fn init_logging(level: LogLevel) {
    let filter = match level {
        LogLevel::Verbose | LogLevel::Debug => LevelFilter::Debug,
        LogLevel::Info => LevelFilter::Info,
        LogLevel::Warn => LevelFilter::Warn,
        LogLevel::Error => LevelFilter::Error,
    };

    let config = ConfigBuilder::new().set_time_format_rfc3339().build();
    let _ = TermLogger::init(filter, config, TerminalMode::Mixed, ColorChoice::Auto);
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let config = cli.into_config()?;
    init_logging(config.log_level);

    let mut controller = Controller::new(config)?;
    let mut events = controller.start();

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    // `ctrl_c` resolves once; once handled it must not be polled again, so
    // it drops out of the select arm set for the rest of the run.
    let mut ctrl_c_pending = true;

    loop {
        tokio::select! {
            event = events.recv() => {
                match event {
                    Some(ControllerEvent::Connected { serial, device_name }) => {
                        println!("connected: {serial} ({device_name})");
                    }
                    Some(ControllerEvent::ConnectionFailed { reason }) => {
                        eprintln!("connection failed: {reason}");
                        break;
                    }
                    Some(ControllerEvent::Disconnected) => {
                        println!("disconnected");
                        break;
                    }
                    None => break,
                }
            }
            _ = &mut ctrl_c, if ctrl_c_pending => {
                println!("stopping...");
                ctrl_c_pending = false;
                controller.stop();
            }
        }
    }

    controller.join().await;
    Ok(())
}
