use serde::{Deserialize, Serialize};

use crate::error::{Result, ScError};

/// Which device the selector should resolve, per §4.D.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum SelectionPolicy {
    #[default]
    Any,
    BySerial(String),
    UsbOnly,
    TcpipOnly,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum LogLevel {
    Verbose,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
}

impl LogLevel {
    pub fn server_string(self) -> &'static str {
        match self {
            LogLevel::Verbose => "verbose",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum VideoCodec {
    #[default]
    H264,
    H265,
    Av1,
}

impl VideoCodec {
    pub fn tag(self) -> &'static str {
        match self {
            VideoCodec::H264 => "h264",
            VideoCodec::H265 => "h265",
            VideoCodec::Av1 => "av1",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AudioCodec {
    #[default]
    Opus,
    Aac,
    Raw,
}

impl AudioCodec {
    pub fn tag(self) -> &'static str {
        match self {
            AudioCodec::Opus => "opus",
            AudioCodec::Aac => "aac",
            AudioCodec::Raw => "raw",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum VideoSource {
    #[default]
    Display,
    Camera,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum AudioSource {
    #[default]
    Output,
    Mic,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum CameraPosition {
    #[default]
    All,
    Front,
    Back,
    External,
}

/// Immutable bring-up configuration (§3 "Configuration"). Owned and
/// `Clone`-derived, so passing it by value into the worker task already
/// gives that task its own copy, independent of the caller's — there is no
/// separate deep-copy step to implement as there would be in C.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    // identity
    pub session_id: u32,
    pub requested_serial: Option<String>,
    pub select_usb: bool,
    pub select_tcpip: bool,
    pub tcpip_enable: bool,
    pub tcpip_dst: Option<String>,

    // streams
    pub video_enabled: bool,
    pub audio_enabled: bool,
    pub control_enabled: bool,
    pub video_codec: VideoCodec,
    pub audio_codec: AudioCodec,
    pub video_bit_rate: u32,
    pub audio_bit_rate: u32,
    pub max_size: u16,
    pub max_fps: u16,
    pub lock_video_orientation: i8,
    pub crop: Option<String>,
    pub video_source: VideoSource,
    pub audio_source: AudioSource,
    pub display_id: u32,
    pub camera_id: Option<String>,
    pub camera_position: CameraPosition,
    pub video_codec_options: Option<String>,
    pub audio_codec_options: Option<String>,
    pub video_encoder: Option<String>,
    pub audio_encoder: Option<String>,

    // transport
    pub force_forward_tunnel: bool,
    pub tunnel_host: Option<String>,
    pub tunnel_port: Option<u16>,
    pub port_range: (u16, u16),

    // lifecycle
    pub kill_bridge_on_close: bool,
    pub cleanup: bool,
    pub power_on: bool,
    pub power_off_on_close: bool,
    pub clipboard_autosync: bool,
    pub downsize_on_error: bool,
    pub log_level: LogLevel,
    pub list_encoders: bool,
    pub list_displays: bool,
    pub list_cameras: bool,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            session_id: 0,
            requested_serial: None,
            select_usb: false,
            select_tcpip: false,
            tcpip_enable: false,
            tcpip_dst: None,

            video_enabled: true,
            audio_enabled: true,
            control_enabled: true,
            video_codec: VideoCodec::default(),
            audio_codec: AudioCodec::default(),
            video_bit_rate: 0,
            audio_bit_rate: 0,
            max_size: 0,
            max_fps: 0,
            lock_video_orientation: -1,
            crop: None,
            video_source: VideoSource::default(),
            audio_source: AudioSource::default(),
            display_id: 0,
            camera_id: None,
            camera_position: CameraPosition::default(),
            video_codec_options: None,
            audio_codec_options: None,
            video_encoder: None,
            audio_encoder: None,

            force_forward_tunnel: false,
            tunnel_host: None,
            tunnel_port: None,
            port_range: (27183, 27199),

            kill_bridge_on_close: false,
            cleanup: true,
            power_on: true,
            power_off_on_close: false,
            clipboard_autosync: true,
            downsize_on_error: true,
            log_level: LogLevel::default(),
            list_encoders: false,
            list_displays: false,
            list_cameras: false,
        }
    }
}

impl Config {
    /// Checks the invariants listed in SPEC_FULL §3.
    pub fn validate(&self) -> Result<()> {
        let exclusive_count = [
            self.requested_serial.is_some(),
            self.select_usb,
            self.select_tcpip,
        ]
        .into_iter()
        .filter(|set| *set)
        .count();
        if exclusive_count > 1 {
            return Err(ScError::AmbiguousDevice(vec![
                "at most one of requested_serial/select_usb/select_tcpip may be set".to_string(),
            ]));
        }

        if self.tcpip_dst.is_some() && !self.tcpip_enable {
            return Err(ScError::TcpipSetupFailed {
                serial: String::new(),
                reason: "tcpip_dst requires tcpip_enable".to_string(),
            });
        }

        if self.tcpip_dst.is_some() && self.requested_serial.is_some() {
            return Err(ScError::TcpipSetupFailed {
                serial: String::new(),
                reason: "tcpip_dst excludes requested_serial".to_string(),
            });
        }

        if self.port_range.0 > self.port_range.1 {
            return Err(ScError::TunnelSetupFailed(format!(
                "invalid port range {}..={}",
                self.port_range.0, self.port_range.1
            )));
        }

        Ok(())
    }

    pub fn list_requested(&self) -> bool {
        self.list_encoders || self.list_displays || self.list_cameras
    }

    /// Derives the §4.D selection policy from the explicit flags, falling
    /// back to `$ANDROID_SERIAL` when nothing was requested explicitly.
    pub fn selection_policy(&self) -> SelectionPolicy {
        if let Some(serial) = &self.requested_serial {
            SelectionPolicy::BySerial(serial.clone())
        } else if self.select_usb {
            SelectionPolicy::UsbOnly
        } else if self.select_tcpip {
            SelectionPolicy::TcpipOnly
        } else if let Ok(env_serial) = std::env::var("ANDROID_SERIAL") {
            SelectionPolicy::BySerial(env_serial)
        } else {
            SelectionPolicy::Any
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_is_valid() {
        Config::default().validate().unwrap();
    }

    #[test]
    fn rejects_multiple_selectors() {
        let mut config = Config {
            requested_serial: Some("abc".to_string()),
            select_usb: true,
            ..Config::default()
        };
        assert!(config.validate().is_err());
        config.select_usb = false;
        config.validate().unwrap();
    }

    #[test]
    fn rejects_tcpip_dst_without_enable() {
        let config = Config {
            tcpip_dst: Some("10.0.0.5".to_string()),
            tcpip_enable: false,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_inverted_port_range() {
        let config = Config {
            port_range: (27199, 27183),
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn selection_policy_prefers_explicit_serial() {
        let config = Config {
            requested_serial: Some("X1".to_string()),
            ..Config::default()
        };
        assert_eq!(
            config.selection_policy(),
            SelectionPolicy::BySerial("X1".to_string())
        );
    }
}
