//! Environment-driven configuration snapshot.
//!
//! `py_handler.py` reads individual `os.environ[...]` entries all over
//! its call graph; here every one of those reads is collected into a single
//! typed `Config`, loaded once at startup and swapped as a whole on
//! `change_var`, matching the never-observe-a-partial-update discipline used
//! for the roster matrix.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use crate::error::ConfigError;
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    pub face_threshold_insightface: f32,
    pub face_threshold_hailo: f32,
    pub age_detecting_sec: f64,
    pub pre_detecting_sec: f64,
    pub pre_recording_sec: f64,
    pub timer_detect_sec: u64,
    pub timer_record_sec: u64,
    pub timer_cam_renew_sec: u64,
    pub timer_init_env_var_sec: u64,
    pub onvif_expiration: String,
    pub detecting_rate_percent: f64,
    pub detecting_sleep_sec: f64,
    pub video_clipping_location: String,
    pub host_id: String,
    pub identity_id: String,
    pub property_code: String,
    pub thing_name: String,
    pub http_port: u16,
    pub use_insightface: bool,
    pub region: String,
    pub video_bucket: String,
    pub cred_provider_host: String,
    pub aws_role_alias: String,
    pub mqtt_broker_url: String,
}

fn var(name: &'static str) -> Result<String, ConfigError> {
    env::var(name).map_err(|_| ConfigError::MissingVar(name))
}

fn var_or(name: &'static str, default: &str) -> String {
    env::var(name).unwrap_or_else(|_| default.to_string())
}

fn parse_or<T: std::str::FromStr>(
    name: &'static str,
    default: T,
) -> Result<T, ConfigError> {
    match env::var(name) {
        Ok(raw) => raw.parse::<T>().map_err(|_| ConfigError::InvalidValue {
            name,
            value: raw,
            reason: "could not parse".to_string(),
        }),
        Err(_) => Ok(default),
    }
}

impl Config {
    /// Load a full snapshot from the process environment. Mirrors
    /// `init_env_var`'s set of required identity fields plus the many
    /// per-timer / per-threshold variables `py_handler.py` reads ad hoc
    /// throughout its call graph.
    pub fn from_env() -> Result<Self, ConfigError> {
        Ok(Config {
            face_threshold_insightface: parse_or("FACE_THRESHOLD_INSIGHTFACE", 0.5)?,
            face_threshold_hailo: parse_or("FACE_THRESHOLD_HAILO", 0.5)?,
            age_detecting_sec: parse_or("AGE_DETECTING_SEC", 2.0)?,
            pre_detecting_sec: parse_or("PRE_DETECTING_SEC", 3.0)?,
            pre_recording_sec: parse_or("PRE_RECORDING_SEC", 5.0)?,
            timer_detect_sec: parse_or("TIMER_DETECT", 20)?,
            timer_record_sec: parse_or("TIMER_RECORD", 15)?,
            timer_cam_renew_sec: parse_or("TIMER_CAM_RENEW", 60)?,
            timer_init_env_var_sec: parse_or("TIMER_INIT_ENV_VAR", 300)?,
            onvif_expiration: var_or("ONVIF_EXPIRATION", "PT1H"),
            detecting_rate_percent: parse_or("DETECTING_RATE_PERCENT", 0.5)?,
            detecting_sleep_sec: parse_or("DETECTING_SLEEP_SEC", 0.1)?,
            video_clipping_location: var_or("VIDEO_CLIPPING_LOCATION", "/tmp/video"),
            host_id: var("HOST_ID")?,
            identity_id: var("IDENTITY_ID")?,
            property_code: var("PROPERTY_CODE")?,
            thing_name: var("AWS_IOT_THING_NAME")?,
            http_port: parse_or("HTTP_PORT", 7777)?,
            use_insightface: var_or("USE_INSIGHTFACE", "true") == "true",
            region: var_or("REGION", "us-east-1"),
            video_bucket: var("VIDEO_BUCKET")?,
            cred_provider_host: var_or("CRED_PROVIDER_HOST", "http://localhost:8888"),
            aws_role_alias: var("AWS_ROLE_ALIAS")?,
            mqtt_broker_url: var_or("MQTT_BROKER_URL", "mqtt://localhost:1883"),
        })
    }

    pub fn face_threshold(&self) -> f32 {
        if self.use_insightface {
            self.face_threshold_insightface
        } else {
            self.face_threshold_hailo
        }
    }

    pub fn timer_detect(&self) -> Duration {
        Duration::from_secs(self.timer_detect_sec)
    }

    pub fn timer_record(&self) -> Duration {
        Duration::from_secs(self.timer_record_sec)
    }

    /// Apply a `change_var`-style runtime override. Values not recognized
    /// are rejected rather than silently ignored so a bad override is
    /// visible to the caller immediately.
    pub fn apply_override(&mut self, key: &str, value: &str) -> Result<(), ConfigError> {
        macro_rules! set_f32 {
            ($field:ident) => {{
                self.$field = value.parse().map_err(|_| ConfigError::InvalidValue {
                    name: stringify!($field),
                    value: value.to_string(),
                    reason: "expected float".to_string(),
                })?;
                return Ok(());
            }};
        }
        macro_rules! set_u64 {
            ($field:ident) => {{
                self.$field = value.parse().map_err(|_| ConfigError::InvalidValue {
                    name: stringify!($field),
                    value: value.to_string(),
                    reason: "expected integer".to_string(),
                })?;
                return Ok(());
            }};
        }
        match key {
            "FACE_THRESHOLD_INSIGHTFACE" => set_f32!(face_threshold_insightface),
            "FACE_THRESHOLD_HAILO" => set_f32!(face_threshold_hailo),
            "AGE_DETECTING_SEC" => set_f32!(age_detecting_sec),
            "PRE_DETECTING_SEC" => set_f32!(pre_detecting_sec),
            "PRE_RECORDING_SEC" => set_f32!(pre_recording_sec),
            "TIMER_DETECT" => set_u64!(timer_detect_sec),
            "TIMER_RECORD" => set_u64!(timer_record_sec),
            "TIMER_CAM_RENEW" => set_u64!(timer_cam_renew_sec),
            "TIMER_INIT_ENV_VAR" => set_u64!(timer_init_env_var_sec),
            "ONVIF_EXPIRATION" => {
                self.onvif_expiration = value.to_string();
                Ok(())
            }
            _ => Err(ConfigError::InvalidValue {
                name: "change_var",
                value: key.to_string(),
                reason: "unrecognized or immutable key".to_string(),
            }),
        }
    }
}
