use serde::{Deserialize, Serialize};
use std::fmt;

/// The source of the incoming video on the device side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoSource {
    H264,
    Mjpeg,
}

impl Default for VideoSource {
    fn default() -> Self {
        VideoSource::H264
    }
}

/// Per-printer configuration. Persisted as part of `AppConfig`.
///
/// `ssh_password` is a secret: it must never reach a log line. `SecretString`
/// below gives it a redacted `Debug` impl while still (de)serializing as a plain
/// JSON string, matching how the rest of the schema round-trips.
#[derive(Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrinterConfig {
    pub name: String,
    pub host: String,
    pub listen_port: u16,

    pub ssh_port: u16,
    pub ssh_user: String,
    pub ssh_password: SecretString,

    pub mqtt_port: u16,
    pub auto_lan_mode: bool,

    pub video_source: VideoSource,
    pub control_port: Option<u16>,
    pub stream_port: Option<u16>,
    pub mjpeg_enabled: bool,
    pub h264_ws_enabled: bool,
    pub hls_enabled: bool,
    pub ll_hls_enabled: bool,
    /// 0 = pass-through (no throttling applied by the MJPEG/HLS transcoders).
    pub max_fps: u32,
    /// 1-100, JPEG quality used by the snapshot decoder and MJPEG encoder.
    pub jpeg_quality: u8,

    pub led_auto_control: bool,
    pub standby_timeout_minutes: u32,

    pub enabled: bool,

    /// Learned once during the first successful `Connecting` phase and cached
    /// thereafter; `None` until first contact.
    pub device_id: Option<String>,
    pub device_type: Option<String>,
    pub model_code: Option<String>,
}

impl Default for PrinterConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            host: String::new(),
            listen_port: 0,
            ssh_port: 22,
            ssh_user: String::new(),
            ssh_password: SecretString::default(),
            mqtt_port: 8883,
            auto_lan_mode: true,
            video_source: VideoSource::default(),
            control_port: None,
            stream_port: None,
            mjpeg_enabled: true,
            h264_ws_enabled: true,
            hls_enabled: true,
            ll_hls_enabled: false,
            max_fps: 0,
            jpeg_quality: 80,
            led_auto_control: false,
            standby_timeout_minutes: 10,
            enabled: true,
            device_id: None,
            device_type: None,
            model_code: None,
        }
    }
}

impl PrinterConfig {
    /// `name` must be a printable identifier, ≤50 chars, `[A-Za-z0-9_-]+` (§3).
    pub fn validate_name(name: &str) -> crate::Result<()> {
        if name.is_empty() || name.len() > 50 {
            return Err(crate::AppError::ConfigInvalid {
                field: "name".into(),
                message: "name must be 1-50 characters".into(),
            });
        }
        if !name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
        {
            return Err(crate::AppError::ConfigInvalid {
                field: "name".into(),
                message: "name must match [A-Za-z0-9_-]+".into(),
            });
        }
        Ok(())
    }

    pub fn validate_port(port: u16) -> crate::Result<()> {
        if port == 0 {
            return Err(crate::AppError::ConfigInvalid {
                field: "listen_port".into(),
                message: "listen_port must be 1-65535".into(),
            });
        }
        Ok(())
    }
}

/// A secret value that serializes transparently as a string but never appears
/// in a `{:?}` formatted log line. Mirrors the teacher's convention of never
/// logging credentials (see `src/config/schema.rs` field comments on units).
#[derive(Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SecretString(String);

impl SecretString {
    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl From<String> for SecretString {
    fn from(s: String) -> Self {
        SecretString(s)
    }
}

impl fmt::Debug for SecretString {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("<redacted>")
    }
}

/// Top-level persisted configuration document.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    /// `0.0.0.0`, `127.0.0.1`, or named interface addresses.
    pub listen_interfaces: Vec<String>,
    pub printers: Vec<PrinterConfig>,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            listen_interfaces: vec!["0.0.0.0".to_string()],
            printers: Vec::new(),
        }
    }
}

impl fmt::Debug for PrinterConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("PrinterConfig")
            .field("name", &self.name)
            .field("host", &self.host)
            .field("listen_port", &self.listen_port)
            .field("enabled", &self.enabled)
            .field("device_id", &self.device_id)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn secret_string_is_redacted_in_debug() {
        let secret = SecretString::from("hunter2".to_string());
        assert_eq!(format!("{:?}", secret), "<redacted>");
        assert_eq!(secret.expose(), "hunter2");
    }

    #[test]
    fn validate_name_rejects_bad_chars() {
        assert!(PrinterConfig::validate_name("printer one").is_err());
        assert!(PrinterConfig::validate_name("printer-1_ok").is_ok());
        assert!(PrinterConfig::validate_name("").is_err());
    }

    #[test]
    fn default_config_has_no_printers() {
        let config = AppConfig::default();
        assert!(config.printers.is_empty());
        assert_eq!(config.listen_interfaces, vec!["0.0.0.0".to_string()]);
    }
}
