//! HTTP ingress: `/recognise` and `/onvif_notifications`, both POST, bound
//! to the address/port the original service uses on its LAN segment.
//! Grounded on `py_handler.py`'s Flask routes of the same name, and on the
//! `vclip-api` crate's axum router/handler shape, since this agent's own
//! codebase has no other precedent for an axum-based server.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::{ConnectInfo, State};
use axum::http::StatusCode;
use axum::routing::post;
use axum::{Json, Router};
use base64::{engine::general_purpose, Engine as _};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use sentinel_core::app_state::AppState;
use sentinel_core::face_analyzer::FaceAnalyzer;

use crate::onvif;

/// Retry schedule for `/recognise` detection size, widest-first. `None`
/// lets the analyzer pick its native size before any explicit downscale is
/// tried.
const DET_SIZE_SCHEDULE: &[Option<(u32, u32)>] = &[
    None,
    Some((640, 640)),
    Some((576, 576)),
    Some((512, 512)),
    Some((448, 448)),
    Some((384, 384)),
    Some((320, 320)),
    Some((256, 256)),
];

pub struct HttpState {
    pub app: Arc<AppState>,
    pub face_analyzer: Arc<dyn FaceAnalyzer>,
    pub http_client: reqwest::blocking::Client,
}

pub fn router(state: Arc<HttpState>) -> Router {
    Router::new()
        .route("/recognise", post(recognise))
        .route("/onvif_notifications", post(onvif_notifications))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct RecogniseRequest {
    #[serde(rename = "faceImgUrl")]
    face_img_url: Option<String>,
    #[serde(flatten)]
    rest: Value,
}

#[derive(Debug, Serialize)]
struct RecogniseResponse {
    #[serde(flatten)]
    rest: Value,
    #[serde(rename = "faceEmbedding", skip_serializing_if = "Option::is_none")]
    face_embedding: Option<Vec<f32>>,
    #[serde(rename = "faceImgBase64", skip_serializing_if = "Option::is_none")]
    face_img_base64: Option<String>,
}

/// `POST /recognise`. An empty body just schedules a roster refresh; a body
/// with `faceImgUrl` additionally downloads and enrolls one face, trying
/// progressively smaller detection sizes until one succeeds.
async fn recognise(
    State(state): State<Arc<HttpState>>,
    body: axum::body::Bytes,
) -> (StatusCode, Json<Value>) {
    if body.is_empty() {
        refresh_roster_now(&state);
        return (StatusCode::OK, Json(Value::Object(Default::default())));
    }

    let req: RecogniseRequest = match serde_json::from_slice(&body) {
        Ok(r) => r,
        Err(e) => {
            warn!("/recognise: malformed body: {e}");
            return (StatusCode::BAD_REQUEST, Json(serde_json::json!({ "error": e.to_string() })));
        }
    };

    let Some(url) = req.face_img_url.clone() else {
        refresh_roster_now(&state);
        return (StatusCode::OK, Json(req.rest));
    };

    let enriched = {
        let state = state.clone();
        tokio::task::spawn_blocking(move || enrich_face(&state, &url))
            .await
            .unwrap_or_else(|e| Err(format!("task join failed: {e}")))
    };

    schedule_roster_refresh_delayed(state, std::time::Duration::from_secs(10));

    match enriched {
        Ok((embedding, crop_jpeg)) => {
            let resp = RecogniseResponse {
                rest: req.rest,
                face_embedding: Some(embedding),
                face_img_base64: Some(general_purpose::STANDARD.encode(crop_jpeg)),
            };
            (StatusCode::OK, Json(serde_json::to_value(resp).unwrap_or(Value::Null)))
        }
        Err(e) => {
            warn!("/recognise: enrollment failed: {e}");
            (StatusCode::UNPROCESSABLE_ENTITY, Json(serde_json::json!({ "error": e })))
        }
    }
}

fn enrich_face(state: &HttpState, url: &str) -> Result<(Vec<f32>, Vec<u8>), String> {
    let bytes = state
        .http_client
        .get(url)
        .send()
        .map_err(|e| e.to_string())?
        .bytes()
        .map_err(|e| e.to_string())?;
    let image = image::load_from_memory(&bytes).map_err(|e| e.to_string())?.to_rgb8();

    for det_size in DET_SIZE_SCHEDULE {
        match state.face_analyzer.analyze(&image, *det_size) {
            Ok(faces) if !faces.is_empty() => {
                let face = &faces[0];
                let [x0, y0, x1, y1] = face.bbox;
                let width = (x1 - x0).max(1) as u32;
                let height = (y1 - y0).max(1) as u32;
                let crop = image::imageops::crop_imm(&image, x0.max(0) as u32, y0.max(0) as u32, width, height)
                    .to_image();
                let mut jpeg = Vec::new();
                crop.write_to(&mut std::io::Cursor::new(&mut jpeg), image::ImageFormat::Jpeg)
                    .map_err(|e| e.to_string())?;
                return Ok((face.embedding.clone(), jpeg));
            }
            Ok(_) => continue,
            Err(e) => {
                warn!("face analyzer error at det_size {det_size:?}: {e}");
                continue;
            }
        }
    }
    Err("no face found at any detection size".to_string())
}

/// Empty-body path: refresh with negligible delay.
fn refresh_roster_now(state: &Arc<HttpState>) {
    let roster_cache = state.app.roster_cache.clone();
    tokio::task::spawn_blocking(move || {
        roster_cache.refresh();
    });
}

/// Enrollment path: the new member may not be queryable from the member
/// store immediately after being written, so the refresh is given a head
/// start.
fn schedule_roster_refresh_delayed(state: Arc<HttpState>, delay: std::time::Duration) {
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        let roster_cache = state.app.roster_cache.clone();
        tokio::task::spawn_blocking(move || {
            roster_cache.refresh();
        })
        .await
        .ok();
    });
}

/// `POST /onvif_notifications`. Parses off the request thread so the
/// handler itself is cheap; dispatches the resulting trigger asynchronously
/// so the HTTP response is never held up by detection-session setup.
async fn onvif_notifications(
    State(state): State<Arc<HttpState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    body: String,
) -> (StatusCode, &'static str) {
    let client_ip = addr.ip().to_string();

    let notification = match onvif::extract_notification(&body, &client_ip) {
        Some(n) => n,
        None => return (StatusCode::OK, "Notification handled"),
    };

    tokio::spawn(async move {
        tokio::task::spawn_blocking(move || dispatch_motion(&state, &notification)).await.ok();
    });

    (StatusCode::OK, "Notification handled")
}

fn dispatch_motion(state: &HttpState, notification: &onvif::MotionNotification) {
    if !notification.is_motion {
        return;
    }
    let Some(camera) = state.app.supervisor.camera_for(&notification.cam_ip) else {
        warn!("onvif motion for unknown camera {}", notification.cam_ip);
        return;
    };
    let Some(session) = state.app.supervisor.session_for(&notification.cam_ip) else {
        return;
    };
    let outcome = state.app.trigger_coordinator.on_onvif_motion(&camera, &session);
    info!("{} onvif motion dispatched: {:?}", notification.cam_ip, outcome);
}
