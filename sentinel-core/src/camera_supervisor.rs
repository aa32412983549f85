//! CameraSupervisor: owns the set of `StreamSession`s, reconciles them
//! against the desired camera fleet, drives ONVIF subscribe/renew, and
//! publishes heartbeats. Grounded on `py_handler.py`'s `init_cameras` /
//! `init_gst_app` periodic-`Timer`-driven reconciliation and self-healing
//! monitor-thread pattern.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use chrono::Utc;
use crossbeam_channel::Sender;
use log::{error, info, warn};
use parking_lot::Mutex;

use crate::config::Config;
use crate::error::SupervisorError;
use crate::event_bus::EventBus;
use crate::models::{Camera, OutputRecord};
use crate::stream_session::StreamSession;

/// Out-of-core capability: the SOAP/WS-Notification subscribe-renew call.
/// The concrete implementation (XML construction over HTTP) lives in the
/// agent binary crate alongside the rest of the HTTP-facing code.
pub trait OnvifClient: Send + Sync {
    fn subscribe_or_renew(&self, cam: &Camera, termination: &str) -> Result<(), SupervisorError>;
    fn unsubscribe(&self, cam: &Camera) -> Result<(), SupervisorError>;
}

/// External source of the desired camera fleet. Deliberately out of scope
/// the core only needs this trait boundary plus the local `cameras.yaml`
/// fallback.
pub trait CameraStore: Send + Sync {
    fn list_cameras(&self) -> Result<Vec<Camera>, SupervisorError>;
}

struct ManagedSession {
    camera: Camera,
    session: Arc<StreamSession>,
}

pub struct CameraSupervisor {
    store: Arc<dyn CameraStore>,
    onvif: Arc<dyn OnvifClient>,
    event_bus: Arc<dyn EventBus>,
    output_tx: Sender<OutputRecord>,
    detector_tx: crossbeam_channel::Sender<crate::models::DetectorQueueItem>,
    frame_stores: Mutex<HashMap<String, Arc<crate::frame_store::FrameBufferStore>>>,
    sessions: Mutex<HashMap<String, ManagedSession>>,
    thing_name: String,
    host_id: String,
    onvif_expiration: String,
    video_root: String,
    pre_recording_sec: f64,
    pre_detecting_sec: f64,
    detecting_rate_percent: f64,
    stop_flag: Arc<AtomicBool>,
}

impl CameraSupervisor {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        store: Arc<dyn CameraStore>,
        onvif: Arc<dyn OnvifClient>,
        event_bus: Arc<dyn EventBus>,
        output_tx: Sender<OutputRecord>,
        detector_tx: crossbeam_channel::Sender<crate::models::DetectorQueueItem>,
        thing_name: String,
        host_id: String,
        onvif_expiration: String,
        video_root: String,
        pre_recording_sec: f64,
        pre_detecting_sec: f64,
        detecting_rate_percent: f64,
    ) -> Arc<Self> {
        Arc::new(CameraSupervisor {
            store,
            onvif,
            event_bus,
            output_tx,
            detector_tx,
            frame_stores: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
            thing_name,
            host_id,
            onvif_expiration,
            video_root,
            pre_recording_sec,
            pre_detecting_sec,
            detecting_rate_percent,
            stop_flag: Arc::new(AtomicBool::new(false)),
        })
    }

    pub fn frame_store_for(&self, cam_ip: &str) -> Option<Arc<crate::frame_store::FrameBufferStore>> {
        self.frame_stores.lock().get(cam_ip).cloned()
    }

    pub fn session_for(&self, cam_ip: &str) -> Option<Arc<StreamSession>> {
        self.sessions.lock().get(cam_ip).map(|m| m.session.clone())
    }

    pub fn camera_for(&self, cam_ip: &str) -> Option<Camera> {
        self.sessions.lock().get(cam_ip).map(|m| m.camera.clone())
    }

    pub fn stop_all(&self) {
        self.stop_flag.store(true, Ordering::SeqCst);
        let mut sessions = self.sessions.lock();
        for (_, managed) in sessions.drain() {
            managed.session.stop(true);
        }
    }

    /// Runs `reconcile()` on the `TIMER_CAM_RENEW` cadence until stopped.
    /// Re-reads `config` every iteration so a live `change_var
    /// TIMER_CAM_RENEW=...` takes effect on the next sleep rather than only
    /// at process startup.
    pub fn run_periodic(self: &Arc<Self>, config: Arc<ArcSwap<Config>>) {
        while !self.stop_flag.load(Ordering::SeqCst) {
            self.reconcile();
            self.publish_heartbeats();
            let period = Duration::from_secs(config.load().timer_cam_renew_sec);
            std::thread::sleep(period);
        }
    }

    /// Full reload of the camera set (the `gocheckin/reset_camera` control
    /// topic and `cameras.yaml` fallback both route here).
    pub fn reconcile(self: &Arc<Self>) {
        let desired = match self.store.list_cameras() {
            Ok(cams) => cams,
            Err(e) => {
                error!("camera store unavailable, skipping reconciliation: {e}");
                return;
            }
        };
        let desired_ips: std::collections::HashSet<String> =
            desired.iter().map(|c| c.cam_ip.clone()).collect();

        let to_remove: Vec<String> = {
            let sessions = self.sessions.lock();
            sessions
                .keys()
                .filter(|ip| !desired_ips.contains(*ip))
                .cloned()
                .collect()
        };
        for cam_ip in to_remove {
            self.remove_camera(&cam_ip);
        }

        for cam in desired {
            let changed = {
                let sessions = self.sessions.lock();
                sessions
                    .get(&cam.cam_ip)
                    .map(|m| m.camera != cam)
                    .unwrap_or(true)
            };
            if changed {
                self.remove_camera(&cam.cam_ip);
                self.add_camera(cam);
            } else {
                self.reconcile_onvif(&cam);
            }
        }

        self.check_self_healing();
    }

    fn add_camera(self: &Arc<Self>, cam: Camera) {
        let frame_store = Arc::new(crate::frame_store::FrameBufferStore::new());
        self.frame_stores.lock().insert(cam.cam_ip.clone(), frame_store.clone());

        let session = match StreamSession::start(
            cam.clone(),
            frame_store,
            self.detector_tx.clone(),
            self.output_tx.clone(),
            self.pre_recording_sec,
            self.pre_detecting_sec,
            self.detecting_rate_percent,
            self.video_root.clone(),
        ) {
            Ok(s) => s,
            Err(e) => {
                error!("{} failed to start stream session: {e}", cam.cam_ip);
                return;
            }
        };

        self.reconcile_onvif(&cam);
        self.sessions
            .lock()
            .insert(cam.cam_ip.clone(), ManagedSession { camera: cam, session });
    }

    fn remove_camera(&self, cam_ip: &str) {
        let removed = self.sessions.lock().remove(cam_ip);
        if let Some(managed) = removed {
            if let Err(e) = self.onvif.unsubscribe(&managed.camera) {
                warn!("{cam_ip} onvif unsubscribe failed: {e}");
            }
            managed.session.stop(false);
        }
        self.frame_stores.lock().remove(cam_ip);
    }

    fn reconcile_onvif(&self, cam: &Camera) {
        let should_subscribe = cam.onvif.as_ref().is_some() && (cam.is_detecting || cam.is_recording);
        if should_subscribe {
            if let Err(e) = self.onvif.subscribe_or_renew(cam, &self.onvif_expiration) {
                warn!("{} onvif subscribe/renew failed: {e}", cam.cam_ip);
            }
        } else if cam.onvif.is_some() {
            if let Err(e) = self.onvif.unsubscribe(cam) {
                warn!("{} onvif unsubscribe failed: {e}", cam.cam_ip);
            }
        }
    }

    /// Restarts any session that transitioned to `Stopped` unexpectedly.
    fn check_self_healing(self: &Arc<Self>) {
        let stopped: Vec<Camera> = {
            let sessions = self.sessions.lock();
            sessions
                .values()
                .filter(|m| {
                    matches!(
                        m.session.status.state(),
                        crate::stream_session::SessionState::Stopped
                    )
                })
                .map(|m| m.camera.clone())
                .collect()
        };
        for cam in stopped {
            warn!("{} session stopped unexpectedly, restarting", cam.cam_ip);
            self.remove_camera(&cam.cam_ip);
            self.add_camera(cam);
        }
    }

    fn publish_heartbeats(&self) {
        let sessions = self.sessions.lock();
        for managed in sessions.values() {
            let payload = serde_json::json!({
                "uuid": managed.camera.uuid,
                "hostId": self.host_id,
                "lastUpdateOn": Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
                "isPlaying": managed.session.status.is_playing(),
            });
            let topic = format!("gocheckin/{}/camera_heartbeat", self.thing_name);
            if let Err(e) = self.event_bus.publish(&topic, &payload) {
                warn!("heartbeat publish failed for {}: {e}", managed.camera.cam_ip);
            }
        }
        let scanner_payload = serde_json::json!({
            "assetId": self.thing_name,
            "assetName": self.thing_name,
            "localIp": local_ip_hint(),
        });
        if let Err(e) = self.event_bus.publish("gocheckin/scanner_detected", &scanner_payload) {
            warn!("scanner heartbeat publish failed: {e}");
        }
    }
}

fn local_ip_hint() -> String {
    std::env::var("HOST_LOCAL_IP").unwrap_or_else(|_| "0.0.0.0".to_string())
}

/// Local `cameras.yaml` fallback, used when the external asset
/// store is unreachable at startup.
pub struct YamlCameraStore {
    path: String,
}

impl YamlCameraStore {
    pub fn new(path: String) -> Self {
        YamlCameraStore { path }
    }
}

impl CameraStore for YamlCameraStore {
    fn list_cameras(&self) -> Result<Vec<Camera>, SupervisorError> {
        let raw = std::fs::read_to_string(&self.path)
            .map_err(|e| SupervisorError::StoreUnavailable(e.to_string()))?;
        serde_yaml2::from_str(&raw).map_err(|e| SupervisorError::StoreUnavailable(e.to_string()))
    }
}
