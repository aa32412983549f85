//! Shared data model.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::time::{Instant, SystemTime};
use uuid::Uuid;

/// Video codec carried by a camera's RTSP source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Codec {
    H264,
    H265,
}

/// A lock asset attached to a camera, relevant only for the legacy-vs-sensor
/// trigger rule in C5.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lock {
    pub asset_id: String,
    #[serde(default)]
    pub with_keypad: bool,
}

/// Descriptor for one ONVIF subsystem on a camera.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnvifDescriptor {
    pub is_subscription: bool,
    pub port: u16,
}

/// Configuration for one RTSP source, owned by CameraSupervisor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Camera {
    pub cam_ip: String,
    pub username: String,
    pub password: String,
    pub codec: Codec,
    pub framerate: u32,
    pub is_detecting: bool,
    pub is_recording: bool,
    pub onvif: Option<OnvifDescriptor>,
    #[serde(default)]
    pub locks: HashMap<String, Lock>,
    pub uuid: String,
    pub name: String,
}

impl Camera {
    /// An ONVIF trigger is suppressed only when every lock has a keypad
    /// (an occupancy sensor) -- see C5's legacy-vs-sensor rule.
    pub fn has_legacy_lock(&self) -> bool {
        if self.locks.is_empty() {
            return true;
        }
        self.locks.values().any(|l| !l.with_keypad)
    }

    pub fn rtsp_url(&self) -> String {
        format!(
            "rtsp://{}:{}@{}/stream1",
            self.username, self.password, self.cam_ip
        )
    }
}

/// A registered member, owned by RosterCache.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Member {
    pub reservation_code: String,
    pub member_no: String,
    pub listing_id: String,
    pub full_name: String,
    pub key_notified: bool,
    pub face_embedding: Vec<f32>,
}

/// Identity used for roster diffing: `(memberNo, reservationCode, first 4
/// embedding values)`.
pub type MemberIdentity = (String, String, [u64; 4]);

impl Member {
    pub fn identity(&self) -> MemberIdentity {
        let mut sig = [0u64; 4];
        for (i, slot) in sig.iter_mut().enumerate() {
            if let Some(v) = self.face_embedding.get(i) {
                *slot = v.to_bits() as u64;
            }
        }
        (self.member_no.clone(), self.reservation_code.clone(), sig)
    }
}

pub fn member_set_identity(members: &[Member]) -> HashSet<MemberIdentity> {
    members.iter().map(Member::identity).collect()
}

/// One compressed sample plus its monotonic wall-clock capture timestamp.
#[derive(Debug, Clone)]
pub struct EncodedFrame {
    pub data: Vec<u8>,
    pub timestamp: SystemTime,
    pub is_random_access_point: bool,
}

/// A raw BGR decoded frame with enough context to route it through the
/// Detector and back to a TriggerContext.
#[derive(Debug, Clone)]
pub struct DecodedFrame {
    pub cam_ip: String,
    pub cam_uuid: String,
    pub cam_name: String,
    pub image: image::RgbImage,
    pub frame_time: SystemTime,
    pub pts_nanos: u64,
    pub detecting_txn: Uuid,
}

/// Messages flowing on the per-session detector queue. A `SessionEnd` pseudo
/// frame lets the Detector free per-camera state without a side channel.
#[derive(Debug, Clone)]
pub enum DetectorQueueItem {
    Frame(DecodedFrame),
    SessionEnd { cam_ip: String, detecting_txn: Uuid },
}

/// Per-camera detection-session bookkeeping, split across C2 (feeding state)
/// and C5 (trigger lifetime policy) as described in the data model.
#[derive(Debug, Clone)]
pub struct DetectionSession {
    pub detecting_txn: Uuid,
    pub started_at: Instant,
    pub started_by_onvif: bool,
    pub fed_frames: u64,
    pub decoded_frames: u64,
}

impl DetectionSession {
    pub fn new(started_by_onvif: bool) -> Self {
        DetectionSession {
            detecting_txn: Uuid::new_v4(),
            started_at: Instant::now(),
            started_by_onvif,
            fed_frames: 0,
            decoded_frames: 0,
        }
    }
}

/// Per-camera accumulated trigger signals for the lifetime of one session,
/// owned by TriggerCoordinator.
#[derive(Debug, Clone, Default)]
pub struct TriggerContext {
    pub onvif_triggered: bool,
    pub specific_locks: HashSet<String>,
    pub active_occupancy: HashSet<String>,
    pub started_by_onvif: bool,
}

/// One matching face, as returned by vectorized roster matching.
#[derive(Debug, Clone)]
pub struct MatchedFace {
    pub bbox: [i32; 4],
    pub embedding: Vec<f32>,
    pub member: Member,
    pub similarity: f32,
}

/// Produced by the Detector, consumed once by the MatchHandler.
#[derive(Debug, Clone)]
pub struct MatchEvent {
    pub cam_ip: String,
    pub cam_uuid: String,
    pub cam_name: String,
    pub raw_image: image::RgbImage,
    pub matched_faces: Vec<MatchedFace>,
    pub detected_ordinal: u64,
    pub first_frame_at: SystemTime,
    pub frame_time: SystemTime,
    pub detecting_txn: Uuid,
    pub trigger: TriggerContext,
}

/// Per-member payload included in a `MemberDetected` output record.
#[derive(Debug, Clone, Serialize)]
pub struct MemberDetectedPayload {
    pub member_no: String,
    pub reservation_code: String,
    pub listing_id: String,
    pub full_name: String,
    pub similarity: f32,
    pub record_time: DateTime<Utc>,
    pub check_in_img_key: String,
    pub property_img_key: String,
    pub key_notified: bool,
    pub onvif_triggered: bool,
    pub occupancy_triggered_locks: Vec<String>,
}

/// Tagged union flowing to the ArtifactSink/EventBus pair.
#[derive(Debug, Clone)]
pub enum OutputRecord {
    MemberDetected {
        cam_ip: String,
        members: Vec<MemberDetectedPayload>,
        snapshot_local_path: String,
        snapshot_key: String,
        record_start: DateTime<Utc>,
        record_end: DateTime<Utc>,
    },
    VideoClipped {
        cam_ip: String,
        local_path: String,
        video_key: String,
        record_start: DateTime<Utc>,
        record_end: DateTime<Utc>,
    },
}
