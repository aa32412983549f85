//! The single output worker described in the concurrency model: polls the
//! bounded output queue, uploads the artifact, and publishes the
//! corresponding egress topic. Grounded on `py_handler.py`'s upload-then-
//! publish ordering for both snapshot and video-clip records.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::SecondsFormat;
use log::{error, info};

use crate::artifact_sink::ArtifactSink;
use crate::event_bus::EventBus;
use crate::models::OutputRecord;

pub struct OutputWorkerConfig {
    pub thing_name: String,
    pub host_id: String,
}

/// Polls `output_rx` with a small sleep between items, uploads the
/// artifact, then publishes the egress message. Upload failure still
/// publishes the message -- the cloud side can retry the object fetch, but
/// the event itself must not be lost -- logged at error level either way.
pub fn run(
    output_rx: crossbeam_channel::Receiver<OutputRecord>,
    artifact_sink: Arc<dyn ArtifactSink>,
    event_bus: Arc<dyn EventBus>,
    config: OutputWorkerConfig,
    stop_flag: Arc<AtomicBool>,
) {
    while !stop_flag.load(Ordering::SeqCst) {
        match output_rx.recv_timeout(Duration::from_millis(200)) {
            Ok(record) => handle_record(record, &artifact_sink, &event_bus, &config),
            Err(crossbeam_channel::RecvTimeoutError::Timeout) => continue,
            Err(crossbeam_channel::RecvTimeoutError::Disconnected) => break,
        }
    }
    info!("output worker exiting");
}

fn handle_record(
    record: OutputRecord,
    artifact_sink: &Arc<dyn ArtifactSink>,
    event_bus: &Arc<dyn EventBus>,
    config: &OutputWorkerConfig,
) {
    match record {
        OutputRecord::MemberDetected {
            cam_ip,
            members,
            snapshot_local_path,
            snapshot_key,
            record_start,
            record_end,
        } => {
            if let Err(e) = artifact_sink.upload(&snapshot_key, &snapshot_local_path) {
                error!("{cam_ip} snapshot upload failed: {e}");
            }
            let topic = format!("gocheckin/{}/member_detected", config.thing_name);
            for member in members {
                let payload = serde_json::json!({
                    "camIp": cam_ip,
                    "memberNo": member.member_no,
                    "reservationCode": member.reservation_code,
                    "listingId": member.listing_id,
                    "fullName": member.full_name,
                    "similarity": member.similarity,
                    "recordTime": member.record_time.to_rfc3339_opts(SecondsFormat::Millis, true),
                    "checkInImgKey": member.check_in_img_key,
                    "propertyImgKey": member.property_img_key,
                    "snapshotKey": snapshot_key,
                    "keyNotified": member.key_notified,
                    "onvifTriggered": member.onvif_triggered,
                    "occupancyTriggeredLocks": member.occupancy_triggered_locks,
                    "recordStart": record_start.to_rfc3339_opts(SecondsFormat::Millis, true),
                    "recordEnd": record_end.to_rfc3339_opts(SecondsFormat::Millis, true),
                });
                if let Err(e) = event_bus.publish(&topic, &payload) {
                    error!("{cam_ip} member_detected publish failed: {e}");
                }
            }
        }
        OutputRecord::VideoClipped {
            cam_ip,
            local_path,
            video_key,
            record_start,
            record_end,
        } => {
            if let Err(e) = artifact_sink.upload(&video_key, &local_path) {
                error!("{cam_ip} video upload failed: {e}");
            }
            let topic = format!("gocheckin/{}/video_clipped", config.thing_name);
            let payload = serde_json::json!({
                "camIp": cam_ip,
                "hostId": config.host_id,
                "videoKey": video_key,
                "recordStart": record_start.to_rfc3339_opts(SecondsFormat::Millis, true),
                "recordEnd": record_end.to_rfc3339_opts(SecondsFormat::Millis, true),
            });
            if let Err(e) = event_bus.publish(&topic, &payload) {
                error!("{cam_ip} video_clipped publish failed: {e}");
            }
        }
    }
}
