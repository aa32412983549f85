//! TriggerCoordinator: merges ONVIF motion and occupancy signals into
//! per-camera detection sessions. Grounded bit-exact on `py_handler.py`'s
//! `trigger_face_detection` / `handle_occupancy_false` / `handle_notification`.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, info};
use parking_lot::Mutex;

use crate::models::{Camera, TriggerContext};
use crate::stream_session::StreamSession;

/// Per-camera `TriggerContext`, single lock, short critical sections -- the
/// discipline used for this shared resource.
pub struct TriggerContextMap {
    inner: Mutex<HashMap<String, TriggerContext>>,
}

impl TriggerContextMap {
    pub fn new() -> Self {
        TriggerContextMap {
            inner: Mutex::new(HashMap::new()),
        }
    }

    /// Remove and return the context for `cam_ip`, attaching it to the match
    /// event the Detector is about to emit (cleared
    /// the moment a match is emitted).
    pub fn take_for_match(&self, cam_ip: &str) -> Option<TriggerContext> {
        self.inner.lock().remove(cam_ip)
    }

    /// Drop the context without consuming it, e.g. a session ending with no
    /// match, or an early stop.
    pub fn clear(&self, cam_ip: &str) {
        self.inner.lock().remove(cam_ip);
    }
}

impl Default for TriggerContextMap {
    fn default() -> Self {
        Self::new()
    }
}

/// Outcome of merging a trigger into a session, telling the caller whether
/// to (re)start feeding and for how long.
#[derive(Debug, PartialEq, Eq)]
pub enum TriggerOutcome {
    /// No existing session; start a fresh one for `duration_sec`.
    StartSession { duration_sec: u64 },
    /// Existing session; extend the feeding timer to `duration_sec`.
    Extend { duration_sec: u64 },
    /// Existing session; merged into context but timer left alone.
    MergedNoExtend,
    /// Suppressed entirely (all-sensor-lock rule).
    Suppressed,
}

pub struct TriggerCoordinator {
    contexts: Arc<TriggerContextMap>,
    timer_detect_sec: u64,
}

impl TriggerCoordinator {
    pub fn new(contexts: Arc<TriggerContextMap>, timer_detect_sec: u64) -> Self {
        TriggerCoordinator {
            contexts,
            timer_detect_sec,
        }
    }

    /// An ONVIF motion notification for `cam`. Suppressed entirely if every
    /// lock on the camera has `withKeypad=true`.
    pub fn on_onvif_motion(&self, cam: &Camera, session: &Arc<StreamSession>) -> TriggerOutcome {
        if !cam.has_legacy_lock() {
            debug!("{} onvif trigger suppressed: all locks are sensor-backed", cam.cam_ip);
            return TriggerOutcome::Suppressed;
        }

        let mut contexts = self.contexts.inner.lock();
        let already_running = session.status.is_feeding();
        let ctx = contexts.entry(cam.cam_ip.clone()).or_default();

        if !already_running {
            ctx.started_by_onvif = true;
            ctx.onvif_triggered = true;
            drop(contexts);
            session.feed_detecting(self.timer_detect_sec);
            info!("{} session started by onvif motion", cam.cam_ip);
            return TriggerOutcome::StartSession {
                duration_sec: self.timer_detect_sec,
            };
        }

        ctx.onvif_triggered = true;
        let started_by_onvif = ctx.started_by_onvif;
        drop(contexts);

        if started_by_onvif {
            session.extend_timer(self.timer_detect_sec);
            TriggerOutcome::Extend {
                duration_sec: self.timer_detect_sec,
            }
        } else {
            TriggerOutcome::MergedNoExtend
        }
    }

    /// `trigger_detection{cam_ip, lock_asset_id}`: occupancy-true. Always
    /// extends the timer.
    pub fn on_occupancy_true(
        &self,
        cam: &Camera,
        lock_asset_id: &str,
        session: &Arc<StreamSession>,
    ) -> TriggerOutcome {
        let mut contexts = self.contexts.inner.lock();
        let already_running = session.status.is_feeding();
        let ctx = contexts.entry(cam.cam_ip.clone()).or_default();
        ctx.specific_locks.insert(lock_asset_id.to_string());
        ctx.active_occupancy.insert(lock_asset_id.to_string());

        if !already_running {
            ctx.started_by_onvif = false;
            drop(contexts);
            session.feed_detecting(self.timer_detect_sec);
            info!("{} session started by occupancy {lock_asset_id}", cam.cam_ip);
            return TriggerOutcome::StartSession {
                duration_sec: self.timer_detect_sec,
            };
        }
        drop(contexts);
        session.extend_timer(self.timer_detect_sec);
        TriggerOutcome::Extend {
            duration_sec: self.timer_detect_sec,
        }
    }

    /// `stop_detection{cam_ip, lock_asset_id}`: occupancy-false. Early-stops
    /// feeding only if the resulting occupancy set is empty, no ONVIF
    /// trigger is active, and the camera carries no legacy lock.
    pub fn on_occupancy_false(
        &self,
        cam: &Camera,
        lock_asset_id: &str,
        session: &Arc<StreamSession>,
    ) {
        let mut contexts = self.contexts.inner.lock();
        let Some(ctx) = contexts.get_mut(&cam.cam_ip) else {
            return;
        };
        ctx.active_occupancy.remove(lock_asset_id);

        let should_stop =
            ctx.active_occupancy.is_empty() && !ctx.onvif_triggered && !cam.has_legacy_lock();
        if should_stop {
            contexts.remove(&cam.cam_ip);
            drop(contexts);
            info!("{} early stop: occupancy cleared with no onvif/legacy backstop", cam.cam_ip);
            session.stop_feeding();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Lock;
    use std::collections::HashMap as StdHashMap;

    fn camera_with_locks(locks: Vec<(&str, bool)>) -> Camera {
        let mut map = StdHashMap::new();
        for (id, keypad) in locks {
            map.insert(
                id.to_string(),
                Lock {
                    asset_id: id.to_string(),
                    with_keypad: keypad,
                },
            );
        }
        Camera {
            cam_ip: "10.0.0.5".to_string(),
            username: "u".to_string(),
            password: "p".to_string(),
            codec: crate::models::Codec::H264,
            framerate: 15,
            is_detecting: true,
            is_recording: false,
            onvif: None,
            locks: map,
            uuid: "uuid-1".to_string(),
            name: "cam".to_string(),
        }
    }

    #[test]
    fn all_sensor_locks_suppress_onvif() {
        let cam = camera_with_locks(vec![("L1", true), ("L2", true)]);
        assert!(!cam.has_legacy_lock());
    }

    #[test]
    fn any_legacy_lock_allows_onvif() {
        let cam = camera_with_locks(vec![("L1", true), ("L2", false)]);
        assert!(cam.has_legacy_lock());
    }

    #[test]
    fn no_locks_counts_as_legacy() {
        let cam = camera_with_locks(vec![]);
        assert!(cam.has_legacy_lock());
    }

    #[test]
    fn early_stop_requires_empty_occupancy_no_onvif_no_legacy() {
        let map = TriggerContextMap::new();
        {
            let mut inner = map.inner.lock();
            let ctx = inner.entry("10.0.0.5".to_string()).or_default();
            ctx.active_occupancy.insert("L1".to_string());
        }
        // Simulated removal without a live StreamSession: assert the
        // predicate directly since StreamSession::stop_feeding needs a real
        // pipeline to construct.
        let mut inner = map.inner.lock();
        let ctx = inner.get_mut("10.0.0.5").unwrap();
        ctx.active_occupancy.remove("L1");
        assert!(ctx.active_occupancy.is_empty());
        assert!(!ctx.onvif_triggered);
    }
}
