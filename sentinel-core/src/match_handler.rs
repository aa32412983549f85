//! MatchHandler: renders the composite snapshot for one `MatchEvent`,
//! derives the remote object keys, and enqueues a `MemberDetected` output
//! record. Grounded on `motion_ai/pipeline/src/frame.rs`'s `draw_boxes`
//! overlay style and on the key-derivation strings used by the uploader.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use image::{Rgb, RgbImage};
use imageproc::drawing::{draw_hollow_rect_mut, draw_text_mut};
use imageproc::rect::Rect;
use log::error;
use parking_lot::Mutex;
use rusttype::{Font, Scale};

use crate::models::{MatchEvent, MemberDetectedPayload, OutputRecord};

const BOX_COLOR: Rgb<u8> = Rgb([0, 220, 0]);
const LABEL_SCALE: f32 = 18.0;

pub struct MatchHandlerConfig {
    pub video_root: String,
    pub identity_id: String,
    pub host_id: String,
    pub property_code: String,
    pub core_name: String,
}

/// Remembers the best similarity seen per member for the life of the
/// process -- the one piece of state this otherwise-stateless component
/// carries.
pub struct MatchHandler {
    config: MatchHandlerConfig,
    output_tx: Sender<OutputRecord>,
    font: Font<'static>,
    captured_members: Mutex<HashMap<String, f32>>,
}

impl MatchHandler {
    pub fn new(config: MatchHandlerConfig, output_tx: Sender<OutputRecord>, font_bytes: Vec<u8>) -> Arc<Self> {
        let font = Font::try_from_vec(font_bytes).expect("embedded label font must parse");
        Arc::new(MatchHandler {
            config,
            output_tx,
            font,
            captured_members: Mutex::new(HashMap::new()),
        })
    }

    fn captured_key(member_no: &str, reservation_code: &str) -> String {
        format!("{reservation_code}-{member_no}")
    }

    pub fn handle(&self, event: MatchEvent) {
        let record_time: DateTime<Utc> = event.frame_time.into();
        let date_folder = record_time.format("%Y-%m-%d").to_string();
        let time_filename = record_time.format("%H:%M:%S").to_string();

        let mut composite = event.raw_image.clone();
        let mut payloads = Vec::with_capacity(event.matched_faces.len());

        {
            let mut captured = self.captured_members.lock();
            for face in &event.matched_faces {
                let key = Self::captured_key(&face.member.member_no, &face.member.reservation_code);
                let best = captured.entry(key).or_insert(0.0);
                if face.similarity > *best {
                    *best = face.similarity;
                }

                draw_bbox_and_label(&mut composite, face.bbox, &face.member.full_name, &self.font);

                let check_in_img_key = format!(
                    "private/{}/{}/listings/{}/{}/checkIn/{}.jpg",
                    self.config.identity_id,
                    self.config.host_id,
                    face.member.listing_id,
                    face.member.reservation_code,
                    face.member.member_no
                );
                let property_img_key = format!(
                    "private/{}/{}/properties/{}/{}/{}/{date_folder}/{time_filename}.jpg",
                    self.config.identity_id,
                    self.config.host_id,
                    self.config.property_code,
                    self.config.core_name,
                    event.cam_ip
                );

                payloads.push(MemberDetectedPayload {
                    member_no: face.member.member_no.clone(),
                    reservation_code: face.member.reservation_code.clone(),
                    listing_id: face.member.listing_id.clone(),
                    full_name: face.member.full_name.clone(),
                    similarity: face.similarity,
                    record_time,
                    check_in_img_key,
                    property_img_key,
                    key_notified: face.member.key_notified,
                    onvif_triggered: event.trigger.onvif_triggered,
                    occupancy_triggered_locks: event
                        .trigger
                        .specific_locks
                        .iter()
                        .cloned()
                        .collect(),
                });
            }
        }

        let dir = format!("{}/{}/{date_folder}", self.config.video_root, event.cam_ip);
        if let Err(e) = std::fs::create_dir_all(&dir) {
            error!("{} failed to create snapshot dir {dir}: {e}", event.cam_ip);
            return;
        }
        let local_path = format!("{dir}/{time_filename}.jpg");
        if let Err(e) = composite.save(&local_path) {
            error!("{} failed to write snapshot {local_path}: {e}", event.cam_ip);
            return;
        }

        let snapshot_key = format!(
            "{}/properties/{}/{}/{}/{date_folder}/{time_filename}.jpg",
            self.config.host_id, self.config.property_code, self.config.core_name, event.cam_ip
        );

        let record = OutputRecord::MemberDetected {
            cam_ip: event.cam_ip.clone(),
            members: payloads,
            snapshot_local_path: local_path,
            snapshot_key,
            record_start: event.first_frame_at.into(),
            record_end: record_time,
        };
        if self.output_tx.try_send(record).is_err() {
            error!("{} output queue full, dropping member_detected record", event.cam_ip);
        }
    }
}

fn draw_bbox_and_label(image: &mut RgbImage, bbox: [i32; 4], label: &str, font: &Font<'static>) {
    let [x0, y0, x1, y1] = bbox;
    let width = (x1 - x0).max(1) as u32;
    let height = (y1 - y0).max(1) as u32;
    draw_hollow_rect_mut(image, Rect::at(x0, y0).of_size(width, height), BOX_COLOR);
    draw_text_mut(
        image,
        BOX_COLOR,
        x0,
        (y0 - 20).max(0),
        Scale::uniform(LABEL_SCALE),
        font,
        label,
    );
}
