//! Sentinel agent: connects to on-premise RTSP cameras, runs trigger-driven
//! face-recognition detection sessions, and publishes matches and clips to
//! the cloud control plane.
//!
//! Copyright (C) 2024  Ardalan Amiri Sani
//!
//! This program is free software: you can redistribute it and/or modify
//! it under the terms of the GNU General Public License as published by
//! the Free Software Foundation, either version 3 of the License, or
//! (at your option) any later version.
//!
//! This program is distributed in the hope that it will be useful,
//! but WITHOUT ANY WARRANTY; without even the implied warranty of
//! MERCHANTABILITY or FITNESS FOR A PARTICULAR PURPOSE.  See the
//! GNU General Public License for more details.
//!
//! You should have received a copy of the GNU General Public License
//! along with this program.  If not, see <https://www.gnu.org/licenses/>.

#[macro_use]
extern crate log;

#[macro_use]
extern crate serde_derive;

mod http_server;
mod onvif;

use std::net::SocketAddr;
use std::process::exit;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use docopt::Docopt;

use sentinel_core::app_state::AppState;
use sentinel_core::artifact_sink::S3PresignedUploader;
use sentinel_core::camera_supervisor::{CameraSupervisor, YamlCameraStore};
use sentinel_core::config::Config;
use sentinel_core::detector::{Detector, RosterMatrix};
use sentinel_core::event_bus::{ControlMessage, MqttEventBus};
use sentinel_core::face_analyzer::OrtFaceAnalyzer;
use sentinel_core::match_handler::{MatchHandler, MatchHandlerConfig};
use sentinel_core::roster_cache::RosterCache;
use sentinel_core::trigger_coordinator::{TriggerContextMap, TriggerCoordinator};

const STATE_DIR_GENERAL: &str = "state";

const USAGE: &str = "
Sentinel camera-ingestion agent: watches RTSP cameras, triggers face-recognition
detection sessions, and publishes matches/clips to the cloud control plane.

Usage:
  sentinel-agent
  sentinel-agent (--version | -v)
  sentinel-agent (--help | -h)

Options:
    --version, -v    Show version
    --help, -h       Show help
";

#[derive(Debug, Clone, Deserialize)]
struct Args {}

fn main() {
    let version = env!("CARGO_PKG_NAME").to_string() + ", version: " + env!("CARGO_PKG_VERSION");
    env_logger::init();

    let _args: Args = Docopt::new(USAGE)
        .map(|d| d.help(true))
        .map(|d| d.version(Some(version)))
        .and_then(|d| d.deserialize())
        .unwrap_or_else(|e| e.exit());

    let config = match Config::from_env() {
        Ok(c) => c,
        Err(e) => {
            error!("configuration error: {e}");
            exit(1);
        }
    };

    std::fs::create_dir_all(STATE_DIR_GENERAL).expect("failed to create state directory");
    std::fs::create_dir_all(&config.video_clipping_location)
        .expect("failed to create video clipping directory");

    if !std::path::Path::new("cameras.yaml").exists() {
        println!("Error retrieving cameras.yaml file, see example_cameras.yaml for an example configuration.");
        exit(1);
    }

    let runtime = tokio::runtime::Runtime::new().expect("failed to build tokio runtime");
    runtime.block_on(run(config));
}

async fn run(config: Config) {
    let stop_flag = Arc::new(AtomicBool::new(false));
    let config = Arc::new(ArcSwap::from_pointee(config));
    let roster = Arc::new(ArcSwap::from_pointee(RosterMatrix::empty()));
    let trigger_contexts = Arc::new(TriggerContextMap::new());
    let cfg = config.load();

    let (detector_tx, detector_rx, output_tx, output_rx) = AppState::bounded_channels();

    let trigger_coordinator = Arc::new(TriggerCoordinator::new(trigger_contexts.clone(), cfg.timer_detect_sec));

    let onvif_client = onvif::OnvifHttpClient::new(local_ip_hint(), cfg.http_port);

    let (control_tx, control_rx) = crossbeam_channel::bounded(128);
    let event_bus = MqttEventBus::connect(&cfg.mqtt_broker_url, &cfg.thing_name, control_tx)
        .unwrap_or_else(|e| {
            error!("mqtt connect failed: {e}");
            exit(1);
        });

    let artifact_sink = S3PresignedUploader::new(
        cfg.cred_provider_host.clone(),
        cfg.aws_role_alias.clone(),
        cfg.region.clone(),
        cfg.video_bucket.clone(),
    );

    let font_bytes = load_label_font();
    let match_handler = MatchHandler::new(
        MatchHandlerConfig {
            video_root: cfg.video_clipping_location.clone(),
            identity_id: cfg.identity_id.clone(),
            host_id: cfg.host_id.clone(),
            property_code: cfg.property_code.clone(),
            core_name: cfg.thing_name.clone(),
        },
        output_tx.clone(),
        font_bytes,
    );

    let camera_store = Arc::new(YamlCameraStore::new("cameras.yaml".to_string()));

    let member_store: Arc<dyn sentinel_core::roster_cache::MemberStore> = Arc::new(NoopMemberStore);
    let roster_cache = Arc::new(RosterCache::new(member_store, roster.clone()));

    let supervisor = CameraSupervisor::new(
        camera_store,
        onvif_client,
        event_bus.clone(),
        output_tx.clone(),
        detector_tx.clone(),
        cfg.thing_name.clone(),
        cfg.host_id.clone(),
        cfg.onvif_expiration.clone(),
        cfg.video_clipping_location.clone(),
        cfg.pre_recording_sec,
        cfg.pre_detecting_sec,
        cfg.detecting_rate_percent,
    );

    let analyzer: Arc<dyn sentinel_core::face_analyzer::FaceAnalyzer> =
        match OrtFaceAnalyzer::load(&std::env::var("FACE_MODEL_PATH").unwrap_or_default()) {
            Ok(a) => Arc::new(a),
            Err(e) => {
                error!("face analyzer model load failed: {e}");
                exit(1);
            }
        };

    let detector = Detector::new(
        detector_rx,
        match_handler.clone(),
        trigger_contexts.clone(),
        roster.clone(),
        analyzer.clone(),
        cfg.face_threshold(),
        Duration::from_secs_f64(cfg.age_detecting_sec),
        Duration::from_secs_f64(cfg.detecting_sleep_sec),
        stop_flag.clone(),
    );

    let app_state = Arc::new(AppState {
        config: config.clone(),
        roster: roster.clone(),
        trigger_contexts,
        trigger_coordinator,
        supervisor: supervisor.clone(),
        match_handler,
        roster_cache: roster_cache.clone(),
        detector_tx,
        output_tx,
        stop_flag: stop_flag.clone(),
    });

    std::thread::spawn(move || detector.run());

    {
        let output_rx = output_rx;
        let artifact_sink = artifact_sink.clone();
        let event_bus = event_bus.clone();
        let stop_flag = stop_flag.clone();
        let worker_config = sentinel_core::output_worker::OutputWorkerConfig {
            thing_name: cfg.thing_name.clone(),
            host_id: cfg.host_id.clone(),
        };
        std::thread::spawn(move || {
            sentinel_core::output_worker::run(output_rx, artifact_sink, event_bus, worker_config, stop_flag)
        });
    }

    {
        let roster_cache = roster_cache.clone();
        let stop_flag = stop_flag.clone();
        let refresh_period = Duration::from_secs(cfg.timer_init_env_var_sec);
        std::thread::spawn(move || roster_cache.run_periodic(refresh_period, stop_flag.as_ref()));
    }

    {
        let supervisor = supervisor.clone();
        let config = config.clone();
        std::thread::spawn(move || supervisor.run_periodic(config));
    }

    spawn_control_message_loop(
        control_rx,
        config.clone(),
        supervisor.clone(),
        app_state.trigger_coordinator.clone(),
        stop_flag.clone(),
    );

    supervisor.reconcile();

    let http_state = Arc::new(http_server::HttpState {
        app: app_state,
        face_analyzer: analyzer,
        http_client: reqwest::blocking::Client::new(),
    });

    let addr = SocketAddr::from(([0, 0, 0, 0], cfg.http_port));
    info!("listening on {addr}");
    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .unwrap_or_else(|e| panic!("failed to bind {addr}: {e}"));
    axum::serve(
        listener,
        http_server::router(http_state).into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .unwrap_or_else(|e| error!("http server exited: {e}"));
}

fn local_ip_hint() -> String {
    std::env::var("HOST_LOCAL_IP").unwrap_or_else(|_| "0.0.0.0".to_string())
}

/// Label font for `MatchHandler`'s snapshot overlay. Read from `FONT_PATH`
/// if set; otherwise falls back to a common DejaVu Sans Mono install path,
/// matching the handful of fixed font locations most Linux base images
/// carry.
fn load_label_font() -> Vec<u8> {
    let path = std::env::var("FONT_PATH")
        .unwrap_or_else(|_| "/usr/share/fonts/truetype/dejavu/DejaVuSansMono.ttf".to_string());
    std::fs::read(&path).unwrap_or_else(|e| {
        error!("failed to read label font at {path}: {e}");
        exit(1);
    })
}

#[allow(clippy::too_many_arguments)]
fn spawn_control_message_loop(
    control_rx: crossbeam_channel::Receiver<ControlMessage>,
    config: Arc<ArcSwap<Config>>,
    supervisor: Arc<CameraSupervisor>,
    trigger_coordinator: Arc<TriggerCoordinator>,
    stop_flag: Arc<AtomicBool>,
) {
    std::thread::spawn(move || {
        while !stop_flag.load(std::sync::atomic::Ordering::SeqCst) {
            match control_rx.recv_timeout(Duration::from_millis(500)) {
                Ok(ControlMessage::ChangeVar { key, value }) => {
                    let mut next = (**config.load()).clone();
                    if let Err(e) = next.apply_override(&key, &value) {
                        warn!("change_var rejected for {key}: {e}");
                    } else {
                        config.store(Arc::new(next));
                        info!("applied change_var {key}={value}");
                    }
                }
                Ok(ControlMessage::ResetCamera) => {
                    info!("reset_camera: reconciling camera fleet");
                    supervisor.reconcile();
                }
                Ok(ControlMessage::ForceDetect { cam_ip }) => {
                    dispatch_onvif_equivalent(&supervisor, &trigger_coordinator, &cam_ip, "force_detect");
                }
                Ok(ControlMessage::TriggerDetection { cam_ip, lock_asset_id }) => match lock_asset_id {
                    Some(lock_asset_id) => {
                        dispatch_occupancy_true(&supervisor, &trigger_coordinator, &cam_ip, &lock_asset_id);
                    }
                    None => {
                        dispatch_onvif_equivalent(&supervisor, &trigger_coordinator, &cam_ip, "trigger_detection");
                    }
                },
                Ok(ControlMessage::StopDetection { cam_ip, lock_asset_id }) => {
                    let (Some(camera), Some(session)) =
                        (supervisor.camera_for(&cam_ip), supervisor.session_for(&cam_ip))
                    else {
                        warn!("stop_detection for unknown camera {cam_ip}");
                        continue;
                    };
                    trigger_coordinator.on_occupancy_false(&camera, &lock_asset_id, &session);
                }
                Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
                Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
            }
        }
    });
}

/// `force_detect`/ONVIF-less `trigger_detection` (no `lock_asset_id`): both
/// synthesize the same onvif-motion-equivalent trigger the original routes
/// through `handle_notification(..., True)`.
fn dispatch_onvif_equivalent(
    supervisor: &Arc<CameraSupervisor>,
    trigger_coordinator: &Arc<TriggerCoordinator>,
    cam_ip: &str,
    source: &str,
) {
    let (Some(camera), Some(session)) = (supervisor.camera_for(cam_ip), supervisor.session_for(cam_ip)) else {
        warn!("{source} for unknown camera {cam_ip}");
        return;
    };
    let outcome = trigger_coordinator.on_onvif_motion(&camera, &session);
    info!("{cam_ip} {source} dispatched: {outcome:?}");
}

fn dispatch_occupancy_true(
    supervisor: &Arc<CameraSupervisor>,
    trigger_coordinator: &Arc<TriggerCoordinator>,
    cam_ip: &str,
    lock_asset_id: &str,
) {
    let (Some(camera), Some(session)) = (supervisor.camera_for(cam_ip), supervisor.session_for(cam_ip)) else {
        warn!("trigger_detection for unknown camera {cam_ip}");
        return;
    };
    let outcome = trigger_coordinator.on_occupancy_true(&camera, lock_asset_id, &session);
    info!("{cam_ip} trigger_detection dispatched: {outcome:?}");
}

struct NoopMemberStore;

impl sentinel_core::roster_cache::MemberStore for NoopMemberStore {
    fn list_active_members(&self) -> Result<Vec<sentinel_core::models::Member>, anyhow::Error> {
        Ok(Vec::new())
    }
}
