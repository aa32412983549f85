//! Core runtime for the camera-ingestion edge agent: capture, detection
//! session triggering, face matching, and output-record assembly. The HTTP
//! ingress and ONVIF SOAP client live in the `sentinel-agent` binary crate;
//! everything here is transport-agnostic.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

pub mod app_state;
pub mod artifact_sink;
pub mod camera_supervisor;
pub mod config;
pub mod detector;
pub mod error;
pub mod event_bus;
pub mod face_analyzer;
pub mod frame_store;
pub mod match_handler;
pub mod models;
pub mod output_worker;
pub mod roster_cache;
pub mod stream_session;
pub mod trigger_coordinator;
