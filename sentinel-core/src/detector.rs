//! Detector: the single shared worker that turns decoded frames from
//! every camera into `MatchEvent`s. Grounded on `face_recognition_base.py`'s
//! `find_match` (the vectorized similarity formula) and `py_handler.py`'s
//! frame-consumption loop (per-camera session tracking, first-match-wins,
//! `SESSION_END` summary logging).
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::HashMap;
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use arc_swap::ArcSwap;
use crossbeam_channel::{Receiver, RecvTimeoutError};
use log::{debug, info, warn};
use ndarray::{Array1, Array2};
use uuid::Uuid;

use crate::face_analyzer::FaceAnalyzer;
use crate::match_handler::MatchHandler;
use crate::models::{DetectorQueueItem, MatchEvent, MatchedFace, Member, TriggerContext};

/// N×512 roster embeddings plus per-row L2 norms, swapped atomically so the
/// Detector never observes a half-built matrix.
pub struct RosterMatrix {
    pub matrix: Array2<f32>,
    pub norms: Array1<f32>,
    pub members: Vec<Member>,
}

impl RosterMatrix {
    pub fn empty() -> Self {
        RosterMatrix {
            matrix: Array2::zeros((0, 512)),
            norms: Array1::zeros(0),
            members: Vec::new(),
        }
    }

    pub fn from_members(members: Vec<Member>) -> Self {
        let rows = members.len();
        let mut matrix = Array2::<f32>::zeros((rows, 512));
        let mut norms = Array1::<f32>::zeros(rows);
        for (i, m) in members.iter().enumerate() {
            for (j, v) in m.face_embedding.iter().take(512).enumerate() {
                matrix[[i, j]] = *v;
            }
            norms[i] = matrix.row(i).dot(&matrix.row(i)).sqrt();
        }
        RosterMatrix {
            matrix,
            norms,
            members,
        }
    }

    /// `sims = (M . e) / (norms * ||e||)`, `argmax`, threshold compare.
    /// Returns `(member, similarity)` of the best match regardless of
    /// threshold so the caller can log a near-miss similarity.
    pub fn best_match(&self, embedding: &[f32]) -> Option<(&Member, f32)> {
        if self.members.is_empty() {
            return None;
        }
        let e = Array1::from_vec(embedding.to_vec());
        let e_norm = e.dot(&e).sqrt();
        if e_norm == 0.0 {
            return None;
        }
        let dots = self.matrix.dot(&e);
        let mut best_idx = 0;
        let mut best_sim = f32::MIN;
        for (i, dot) in dots.iter().enumerate() {
            let denom = self.norms[i] * e_norm;
            let sim = if denom == 0.0 { 0.0 } else { dot / denom };
            if sim > best_sim {
                best_sim = sim;
                best_idx = i;
            }
        }
        Some((&self.members[best_idx], best_sim))
    }
}

struct CameraSession {
    detecting_txn: Uuid,
    identified: bool,
    detected: u64,
    first_frame_at: Option<SystemTime>,
    started_at: Instant,
}

impl CameraSession {
    fn new(detecting_txn: Uuid) -> Self {
        CameraSession {
            detecting_txn,
            identified: false,
            detected: 0,
            first_frame_at: None,
            started_at: Instant::now(),
        }
    }
}

pub struct Detector {
    input_rx: Receiver<DetectorQueueItem>,
    match_handler: Arc<MatchHandler>,
    trigger_contexts: Arc<crate::trigger_coordinator::TriggerContextMap>,
    roster: Arc<ArcSwap<RosterMatrix>>,
    analyzer: Arc<dyn FaceAnalyzer>,
    threshold: f32,
    age_detecting: Duration,
    idle_sleep: Duration,
    sessions: HashMap<String, CameraSession>,
    stop_flag: Arc<std::sync::atomic::AtomicBool>,
}

impl Detector {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        input_rx: Receiver<DetectorQueueItem>,
        match_handler: Arc<MatchHandler>,
        trigger_contexts: Arc<crate::trigger_coordinator::TriggerContextMap>,
        roster: Arc<ArcSwap<RosterMatrix>>,
        analyzer: Arc<dyn FaceAnalyzer>,
        threshold: f32,
        age_detecting: Duration,
        idle_sleep: Duration,
        stop_flag: Arc<std::sync::atomic::AtomicBool>,
    ) -> Self {
        Detector {
            input_rx,
            match_handler,
            trigger_contexts,
            roster,
            analyzer,
            threshold,
            age_detecting,
            idle_sleep,
            sessions: HashMap::new(),
            stop_flag,
        }
    }

    /// The Detector's main loop: block on the queue with a short sleep when
    /// empty (`DETECTING_SLEEP_SEC`).
    pub fn run(mut self) {
        while !self.stop_flag.load(std::sync::atomic::Ordering::SeqCst) {
            match self.input_rx.recv_timeout(self.idle_sleep) {
                Ok(item) => self.handle_item(item),
                Err(RecvTimeoutError::Timeout) => continue,
                Err(RecvTimeoutError::Disconnected) => break,
            }
        }
        info!("detector loop exiting");
    }

    fn handle_item(&mut self, item: DetectorQueueItem) {
        match item {
            DetectorQueueItem::Frame(frame) => self.handle_frame(frame),
            DetectorQueueItem::SessionEnd {
                cam_ip,
                detecting_txn,
            } => self.handle_session_end(cam_ip, detecting_txn),
        }
    }

    fn handle_frame(&mut self, frame: crate::models::DecodedFrame) {
        let cam_ip = frame.cam_ip.clone();
        let session = self
            .sessions
            .entry(cam_ip.clone())
            .or_insert_with(|| CameraSession::new(frame.detecting_txn));

        if session.detecting_txn != frame.detecting_txn {
            *session = CameraSession::new(frame.detecting_txn);
        }

        if session.identified {
            return;
        }

        let age = SystemTime::now()
            .duration_since(frame.frame_time)
            .unwrap_or_default();
        if age > self.age_detecting {
            debug!("{cam_ip} stale decoded frame dropped (age={age:?})");
            return;
        }

        session.detected += 1;
        if session.first_frame_at.is_none() {
            session.first_frame_at = Some(frame.frame_time);
        }

        let faces = match self.analyzer.analyze(&frame.image, None) {
            Ok(faces) => faces,
            Err(e) => {
                warn!("{cam_ip} analyzer fault, frame dropped: {e}");
                return;
            }
        };
        if faces.is_empty() {
            return;
        }

        let roster = self.roster.load();
        let mut matched_faces = Vec::new();
        for face in &faces {
            if let Some((member, sim)) = roster.best_match(&face.embedding) {
                if sim >= self.threshold {
                    matched_faces.push(MatchedFace {
                        bbox: face.bbox,
                        embedding: face.embedding.clone(),
                        member: member.clone(),
                        similarity: sim,
                    });
                } else {
                    debug!("{cam_ip} best similarity {sim:.3} below threshold {}", self.threshold);
                }
            }
        }

        if matched_faces.is_empty() {
            return;
        }

        session.identified = true;
        let trigger = self
            .trigger_contexts
            .take_for_match(&cam_ip)
            .unwrap_or_default();

        let event = MatchEvent {
            cam_ip: cam_ip.clone(),
            cam_uuid: frame.cam_uuid,
            cam_name: frame.cam_name,
            raw_image: frame.image,
            matched_faces,
            detected_ordinal: session.detected,
            first_frame_at: session.first_frame_at.unwrap_or(frame.frame_time),
            frame_time: frame.frame_time,
            detecting_txn: frame.detecting_txn,
            trigger,
        };
        self.match_handler.handle(event);
    }

    fn handle_session_end(&mut self, cam_ip: String, detecting_txn: Uuid) {
        if let Some(session) = self.sessions.remove(&cam_ip) {
            if session.detecting_txn != detecting_txn {
                return;
            }
            info!(
                "{cam_ip} session {detecting_txn} ended: frames={}, identified={}, duration_ms={}",
                session.detected,
                session.identified,
                session.started_at.elapsed().as_millis()
            );
            if !session.identified {
                self.trigger_contexts.clear(&cam_ip);
            }
        }
    }
}

/// Builds a fresh `RosterMatrix` from `members` and swaps it into `roster` in
/// one atomic store, so readers never see a partially-updated roster.
/// No-op (not even a rebuild) if the identity set is unchanged.
pub fn apply_roster_update(
    roster: &Arc<ArcSwap<RosterMatrix>>,
    last_identity: &Arc<parking_lot::Mutex<std::collections::HashSet<crate::models::MemberIdentity>>>,
    members: Vec<Member>,
) -> bool {
    let new_identity = crate::models::member_set_identity(&members);
    let mut last = last_identity.lock();
    if *last == new_identity {
        return false;
    }
    *last = new_identity;
    drop(last);
    roster.store(Arc::new(RosterMatrix::from_members(members)));
    true
}

#[cfg(test)]
mod tests {
    use super::*;

    fn member(no: &str, emb: Vec<f32>) -> Member {
        Member {
            reservation_code: format!("R{no}"),
            member_no: no.to_string(),
            listing_id: "L1".to_string(),
            full_name: "Test Member".to_string(),
            key_notified: false,
            face_embedding: emb,
        }
    }

    #[test]
    fn best_match_picks_highest_cosine_similarity() {
        let m1 = member("1", vec![1.0, 0.0]);
        let m2 = member("2", vec![0.0, 1.0]);
        let mut m1_full = vec![0.0f32; 512];
        m1_full[0] = 1.0;
        let mut m2_full = vec![0.0f32; 512];
        m2_full[1] = 1.0;
        let roster = RosterMatrix::from_members(vec![
            Member { face_embedding: m1_full, ..m1 },
            Member { face_embedding: m2_full, ..m2 },
        ]);
        let mut probe = vec![0.0f32; 512];
        probe[1] = 1.0;
        let (matched, sim) = roster.best_match(&probe).unwrap();
        assert_eq!(matched.member_no, "2");
        assert!((sim - 1.0).abs() < 1e-5);
    }

    #[test]
    fn empty_roster_never_matches() {
        let roster = RosterMatrix::empty();
        assert!(roster.best_match(&vec![1.0f32; 512]).is_none());
    }
}
