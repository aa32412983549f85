//! Typed error enums for component boundaries that have a caller able to act
//! on the distinction. Worker-loop bodies that only ever log-and-continue use
//! `anyhow::Error` instead.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use thiserror::Error;

#[derive(Error, Debug)]
pub enum StreamError {
    #[error("pipeline build failed: {0}")]
    PipelineBuild(String),

    #[error("capture pipeline could not reach PLAYING after {attempts} attempt(s)")]
    StartRetriesExhausted { attempts: u32 },

    #[error("gstreamer bus error on {pipeline}: {message}")]
    Bus { pipeline: &'static str, message: String },

    #[error("camera unreachable: {0}")]
    ResourceUnreadable(String),

    #[error("session is not playing")]
    NotPlaying,
}

#[derive(Error, Debug)]
pub enum DetectorError {
    #[error("face analyzer fault: {0}")]
    Analyzer(String),

    #[error("roster matrix dimension mismatch: matrix has {rows} rows, norms has {norms}")]
    DimensionMismatch { rows: usize, norms: usize },
}

#[derive(Error, Debug)]
pub enum ArtifactSinkError {
    #[error("credential fetch failed: {0}")]
    Credentials(String),

    #[error("upload failed with status {status}: {body}")]
    UploadStatus { status: u16, body: String },

    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    #[error("local file missing: {0}")]
    LocalFile(std::io::Error),
}

#[derive(Error, Debug)]
pub enum EventBusError {
    #[error("publish failed for topic {topic}: {source}")]
    Publish { topic: String, source: String },

    #[error("not connected")]
    NotConnected,
}

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("missing required environment variable: {0}")]
    MissingVar(&'static str),

    #[error("invalid value for {name}: {value:?} ({reason})")]
    InvalidValue {
        name: &'static str,
        value: String,
        reason: String,
    },
}

#[derive(Error, Debug)]
pub enum SupervisorError {
    #[error("camera descriptor store unavailable: {0}")]
    StoreUnavailable(String),

    #[error("onvif subscription failed for {cam_ip}: {source}")]
    OnvifSubscribe { cam_ip: String, source: String },
}
