//! StreamSession: one RTSP capture pipeline plus an on-demand decode
//! pipeline, grounded on `gstreamer_threading.py`'s `StreamCapture` thread --
//! the pipeline element strings, bus-message handling, and
//! feed/extend/stop-feeding semantics are translated one-for-one, using the
//! real `gstreamer`/`gstreamer-app` crates instead of `retina`, since the
//! capture pipeline is GStreamer-literal (`PLAYING` state, bus `ERROR`/`EOS`,
//! warning promotion for "Could not read from resource."). See `DESIGN.md`
//! for the rationale.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use gstreamer as gst;
use gstreamer::prelude::*;
use gstreamer_app as gst_app;
use gstreamer_video as gst_video;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::thread::JoinHandle;
use std::time::{Duration, Instant, SystemTime};

use chrono::{DateTime, Utc};
use crossbeam_channel::Sender;
use log::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::StreamError;
use crate::frame_store::FrameBufferStore;
use crate::models::{Camera, Codec, DecodedFrame, DetectorQueueItem, EncodedFrame, OutputRecord};

const CAPTURE_RETRY_ATTEMPTS: u32 = 2;
const CAPTURE_RETRY_BACKOFF: Duration = Duration::from_secs(10);
const BUS_POLL_TIMEOUT: gst::ClockTime = gst::ClockTime::from_mseconds(100);
const RESOURCE_UNREADABLE_MARKER: &str = "Could not read from resource.";

/// State machine for one camera's session. `feeding`/`recording` flip
/// independently while in `Playing`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    New,
    Starting,
    Playing,
    Stopping,
    Stopped,
}

struct RecordingMeta {
    start_utc: String,
}

/// Shared, cheaply-clonable status handle -- the pieces of StreamSession
/// state that the trigger coordinator and camera supervisor need to read
/// without touching the GStreamer objects themselves.
pub struct SessionStatus {
    state: Mutex<SessionState>,
    is_playing: AtomicBool,
    is_feeding: AtomicBool,
    is_recording: AtomicBool,
}

impl SessionStatus {
    fn new() -> Self {
        SessionStatus {
            state: Mutex::new(SessionState::New),
            is_playing: AtomicBool::new(false),
            is_feeding: AtomicBool::new(false),
            is_recording: AtomicBool::new(false),
        }
    }

    pub fn is_playing(&self) -> bool {
        self.is_playing.load(Ordering::SeqCst)
    }

    pub fn is_feeding(&self) -> bool {
        self.is_feeding.load(Ordering::SeqCst)
    }

    pub fn is_recording(&self) -> bool {
        self.is_recording.load(Ordering::SeqCst)
    }

    pub fn state(&self) -> SessionState {
        *self.state.lock().unwrap()
    }
}

/// One camera's capture + decode pipeline pair.
pub struct StreamSession {
    pub cam: Camera,
    pub status: Arc<SessionStatus>,
    frame_store: Arc<FrameBufferStore>,
    detecting_txn: Mutex<Option<Uuid>>,
    feed_deadline: Arc<Mutex<Option<Instant>>>,
    /// Set once per `feed_detecting` call, left untouched by `extend_timer` --
    /// the fixed window the pushed-frame cap is computed against.
    session_duration_sec: AtomicU64,
    recording: Mutex<Option<RecordingMeta>>,
    pushed_since_feed: AtomicU64,
    pre_recording_sec: f64,
    pre_detecting_sec: f64,
    detecting_rate_percent: f64,
    video_root: String,
    capture_pipeline: gst::Pipeline,
    decode_pipeline: gst::Pipeline,
    decode_src: gst_app::AppSrc,
    stop_flag: Arc<AtomicBool>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    detector_tx: Sender<DetectorQueueItem>,
    output_tx: Sender<OutputRecord>,
}

fn depay_parse_decoder(codec: Codec) -> (&'static str, &'static str, &'static str) {
    match codec {
        Codec::H264 => ("rtph264depay", "h264parse", "avdec_h264"),
        Codec::H265 => ("rtph265depay", "h265parse", "avdec_h265"),
    }
}

impl StreamSession {
    /// `start()`. Builds both pipelines, retries the capture pipeline's
    /// transition to PLAYING with a bounded, fixed-backoff schedule, then
    /// spawns the bus-poll and appsink-pull worker threads.
    #[allow(clippy::too_many_arguments)]
    pub fn start(
        cam: Camera,
        frame_store: Arc<FrameBufferStore>,
        detector_tx: Sender<DetectorQueueItem>,
        output_tx: Sender<OutputRecord>,
        pre_recording_sec: f64,
        pre_detecting_sec: f64,
        detecting_rate_percent: f64,
        video_root: String,
    ) -> Result<Arc<Self>, StreamError> {
        gst::init().map_err(|e| StreamError::PipelineBuild(e.to_string()))?;

        let (depay, parse, decoder_elem) = depay_parse_decoder(cam.codec);

        let capture_desc = format!(
            "rtspsrc location={url} latency=200 name=src \
             ! {depay} \
             ! {parse} config-interval=1 \
             ! appsink name=capture_sink emit-signals=true sync=false drop=false",
            url = cam.rtsp_url(),
            depay = depay,
            parse = parse,
        );

        let decode_desc = format!(
            "appsrc name=decode_src format=time is-live=true do-timestamp=false \
             ! {parse} \
             ! {decoder} \
             ! videorate \
             ! videoconvert \
             ! appsink name=decode_sink emit-signals=true sync=false max-buffers=1 drop=true \
               caps=video/x-raw,format=BGR",
            parse = parse,
            decoder = decoder_elem,
        );

        let capture_pipeline = gst::parse::launch(&capture_desc)
            .map_err(|e| StreamError::PipelineBuild(e.to_string()))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| StreamError::PipelineBuild("capture pipeline is not a Pipeline".into()))?;

        let decode_pipeline = gst::parse::launch(&decode_desc)
            .map_err(|e| StreamError::PipelineBuild(e.to_string()))?
            .downcast::<gst::Pipeline>()
            .map_err(|_| StreamError::PipelineBuild("decode pipeline is not a Pipeline".into()))?;

        let decode_src = decode_pipeline
            .by_name("decode_src")
            .ok_or_else(|| StreamError::PipelineBuild("missing decode_src".into()))?
            .downcast::<gst_app::AppSrc>()
            .map_err(|_| StreamError::PipelineBuild("decode_src is not an AppSrc".into()))?;

        let status = Arc::new(SessionStatus::new());
        *status.state.lock().unwrap() = SessionState::Starting;

        let mut attempt = 0;
        loop {
            attempt += 1;
            info!("{} start() attempt {attempt}/{CAPTURE_RETRY_ATTEMPTS}", cam.cam_ip);
            capture_pipeline
                .set_state(gst::State::Playing)
                .map_err(|e| StreamError::PipelineBuild(e.to_string()))?;

            let reached = capture_pipeline
                .state(gst::ClockTime::from_seconds(5))
                .1
                == gst::State::Playing;

            if reached {
                break;
            }
            let _ = capture_pipeline.set_state(gst::State::Null);
            if attempt >= CAPTURE_RETRY_ATTEMPTS {
                *status.state.lock().unwrap() = SessionState::Stopped;
                return Err(StreamError::StartRetriesExhausted { attempts: attempt });
            }
            std::thread::sleep(CAPTURE_RETRY_BACKOFF);
        }

        decode_pipeline
            .set_state(gst::State::Playing)
            .map_err(|e| StreamError::PipelineBuild(e.to_string()))?;

        status.is_playing.store(true, Ordering::SeqCst);
        *status.state.lock().unwrap() = SessionState::Playing;

        let session = Arc::new(StreamSession {
            cam,
            status,
            frame_store,
            detecting_txn: Mutex::new(None),
            feed_deadline: Arc::new(Mutex::new(None)),
            session_duration_sec: AtomicU64::new(0),
            recording: Mutex::new(None),
            pushed_since_feed: AtomicU64::new(0),
            pre_recording_sec,
            pre_detecting_sec,
            detecting_rate_percent,
            video_root,
            capture_pipeline,
            decode_pipeline,
            decode_src,
            stop_flag: Arc::new(AtomicBool::new(false)),
            threads: Mutex::new(Vec::new()),
            detector_tx,
            output_tx,
        });

        session.spawn_workers();
        Ok(session)
    }

    fn spawn_workers(self: &Arc<Self>) {
        let mut threads = self.threads.lock().unwrap();
        threads.push(self.clone().spawn_capture_bus_thread());
        threads.push(self.clone().spawn_decode_bus_thread());
        threads.push(self.clone().spawn_capture_sample_thread());
        threads.push(self.clone().spawn_decode_sample_thread());
        threads.push(self.clone().spawn_timer_thread());
    }

    /// Polls the capture pipeline bus at a 100ms timeout, matching the
    /// source's dual-bus `run()` loop. ERROR/EOS and the resource-unreadable
    /// warning all transition the session to `Stopping`.
    fn spawn_capture_bus_thread(self: Arc<Self>) -> JoinHandle<()> {
        let bus = self.capture_pipeline.bus().expect("pipeline has a bus");
        std::thread::spawn(move || {
            while !self.stop_flag.load(Ordering::SeqCst) {
                if let Some(msg) = bus.timed_pop(BUS_POLL_TIMEOUT) {
                    self.handle_bus_message("capture", &msg);
                }
            }
        })
    }

    fn spawn_decode_bus_thread(self: Arc<Self>) -> JoinHandle<()> {
        let bus = self.decode_pipeline.bus().expect("pipeline has a bus");
        std::thread::spawn(move || {
            while !self.stop_flag.load(Ordering::SeqCst) {
                if let Some(msg) = bus.timed_pop(BUS_POLL_TIMEOUT) {
                    self.handle_bus_message("decode", &msg);
                }
            }
        })
    }

    fn handle_bus_message(self: &Arc<Self>, pipeline: &'static str, msg: &gst::Message) {
        use gst::MessageView;
        match msg.view() {
            MessageView::Error(err) => {
                error!("{} {pipeline} pipeline ERROR: {}", self.cam.cam_ip, err.error());
                self.on_fatal(pipeline, err.error().to_string());
            }
            MessageView::Eos(_) => {
                info!("{} {pipeline} pipeline EOS", self.cam.cam_ip);
                self.on_fatal(pipeline, "EOS".to_string());
            }
            MessageView::Warning(warning) => {
                let text = warning.error().to_string();
                if text.contains(RESOURCE_UNREADABLE_MARKER) {
                    error!("{} {pipeline} warning promoted to error: {text}", self.cam.cam_ip);
                    self.on_fatal(pipeline, text);
                } else {
                    warn!("{} {pipeline} warning: {text}", self.cam.cam_ip);
                }
            }
            MessageView::StateChanged(sc) => {
                if msg.src().map(|s| s == self.capture_pipeline).unwrap_or(false) {
                    let playing = sc.current() == gst::State::Playing;
                    self.status.is_playing.store(playing, Ordering::SeqCst);
                }
            }
            _ => {}
        }
    }

    fn on_fatal(self: &Arc<Self>, _pipeline: &'static str, _reason: String) {
        self.stop_flag.store(true, Ordering::SeqCst);
        self.status.is_playing.store(false, Ordering::SeqCst);
        let _ = self.capture_pipeline.set_state(gst::State::Null);
        let _ = self.decode_pipeline.set_state(gst::State::Null);
        *self.status.state.lock().unwrap() = SessionState::Stopped;
    }

    /// Frame-path contract for the capture appsink: stamp, append to
    /// pre-buffer, feed the detecting-buffer or the decode pipeline.
    fn spawn_capture_sample_thread(self: Arc<Self>) -> JoinHandle<()> {
        let appsink = self
            .capture_pipeline
            .by_name("capture_sink")
            .expect("capture_sink exists")
            .downcast::<gst_app::AppSink>()
            .expect("capture_sink is an AppSink");

        std::thread::spawn(move || {
            while !self.stop_flag.load(Ordering::SeqCst) {
                let Some(sample) = appsink.try_pull_sample(gst::ClockTime::from_mseconds(200))
                else {
                    continue;
                };
                let Some(buffer) = sample.buffer() else { continue };
                let Ok(map) = buffer.map_readable() else { continue };
                let data = map.as_slice().to_vec();
                let now = SystemTime::now();
                let pts_nanos = buffer.pts().map(|t| t.nseconds()).unwrap_or(0);

                let encoded = EncodedFrame {
                    data: data.clone(),
                    timestamp: now,
                    is_random_access_point: !buffer
                        .flags()
                        .contains(gst::BufferFlags::DELTA_UNIT),
                };

                self.frame_store.pre_buffer.append(
                    encoded.clone(),
                    Duration::from_secs_f64(self.pre_recording_sec),
                    self.status.is_recording(),
                );

                if self.status.is_feeding() {
                    self.drain_detecting_buffer_into_decoder();
                    self.push_into_decoder(&data, now, pts_nanos);
                } else {
                    self.frame_store.detecting_buffer.append(
                        encoded,
                        Duration::from_secs_f64(self.pre_detecting_sec),
                        false,
                    );
                }
            }
        })
    }

    fn drain_detecting_buffer_into_decoder(&self) {
        let pending = self.frame_store.detecting_buffer.snapshot();
        if pending.is_empty() {
            return;
        }
        self.frame_store.detecting_buffer.clear();
        for frame in pending {
            let pts_nanos = frame
                .timestamp
                .duration_since(SystemTime::UNIX_EPOCH)
                .map(|d| d.as_nanos() as u64)
                .unwrap_or(0);
            self.push_into_decoder(&frame.data, frame.timestamp, pts_nanos);
        }
    }

    fn push_into_decoder(&self, data: &[u8], capture_time: SystemTime, pts_nanos: u64) {
        let session_duration_sec = self.session_duration_sec.load(Ordering::SeqCst);
        let max_frames = (self.cam.framerate as u64) * session_duration_sec;
        if self.pushed_since_feed.load(Ordering::SeqCst) >= max_frames.max(1) {
            return;
        }
        self.frame_store.pts_metadata.insert(pts_nanos, capture_time);

        let mut buffer = gst::Buffer::from_mut_slice(data.to_vec());
        {
            let buf = buffer.get_mut().expect("sole owner of fresh buffer");
            buf.set_pts(gst::ClockTime::from_nseconds(pts_nanos));
        }
        if self.decode_src.push_buffer(buffer).is_ok() {
            self.pushed_since_feed.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Decoded-frame appsink: look up the PTS in the metadata store, enqueue
    /// into the Detector's bounded queue, drop on full.
    fn spawn_decode_sample_thread(self: Arc<Self>) -> JoinHandle<()> {
        let appsink = self
            .decode_pipeline
            .by_name("decode_sink")
            .expect("decode_sink exists")
            .downcast::<gst_app::AppSink>()
            .expect("decode_sink is an AppSink");
        let cam_ip = self.cam.cam_ip.clone();
        let cam_uuid = self.cam.uuid.clone();
        let cam_name = self.cam.name.clone();

        std::thread::spawn(move || {
            while !self.stop_flag.load(Ordering::SeqCst) {
                if !self.status.is_feeding() {
                    std::thread::sleep(Duration::from_millis(50));
                    continue;
                }
                let Some(sample) = appsink.try_pull_sample(gst::ClockTime::from_mseconds(200))
                else {
                    continue;
                };
                let Some(buffer) = sample.buffer() else { continue };
                let Some(caps) = sample.caps() else { continue };
                let Ok(info) = gst_video::VideoInfo::from_caps(caps) else { continue };
                let Ok(map) = buffer.map_readable() else { continue };

                let pts_nanos = buffer.pts().map(|t| t.nseconds()).unwrap_or(0);
                let frame_time = self
                    .frame_store
                    .pts_metadata
                    .lookup(pts_nanos)
                    .unwrap_or_else(SystemTime::now);

                let Some(image) = image::RgbImage::from_raw(
                    info.width(),
                    info.height(),
                    map.as_slice().to_vec(),
                ) else {
                    continue;
                };

                let Some(txn) = *self.detecting_txn.lock().unwrap() else { continue };

                let item = DetectorQueueItem::Frame(DecodedFrame {
                    cam_ip: cam_ip.clone(),
                    cam_uuid: cam_uuid.clone(),
                    cam_name: cam_name.clone(),
                    image,
                    frame_time,
                    pts_nanos,
                    detecting_txn: txn,
                });

                if self.detector_tx.try_send(item).is_err() {
                    error!("{cam_ip} detector queue full, dropping decoded frame");
                }
            }
        })
    }

    /// Watches `feed_deadline` so `stop_feeding` fires without a dedicated
    /// cancellable-timer type -- matching the 100ms-granularity poll used
    /// for bus messages elsewhere in this component.
    fn spawn_timer_thread(self: Arc<Self>) -> JoinHandle<()> {
        std::thread::spawn(move || {
            while !self.stop_flag.load(Ordering::SeqCst) {
                std::thread::sleep(Duration::from_millis(100));
                let fire = {
                    let deadline = self.feed_deadline.lock().unwrap();
                    matches!(*deadline, Some(d) if Instant::now() >= d)
                };
                if fire && self.status.is_feeding() {
                    self.stop_feeding();
                }
            }
        })
    }

    /// `feed_detecting(duration_sec)`.
    pub fn feed_detecting(self: &Arc<Self>, duration_sec: u64) {
        if self.status.is_feeding() {
            return;
        }
        self.frame_store.detecting_buffer.clear();
        *self.detecting_txn.lock().unwrap() = Some(Uuid::new_v4());
        self.pushed_since_feed.store(0, Ordering::SeqCst);
        self.session_duration_sec.store(duration_sec, Ordering::SeqCst);
        self.status.is_feeding.store(true, Ordering::SeqCst);
        *self.feed_deadline.lock().unwrap() =
            Some(Instant::now() + Duration::from_secs(duration_sec));
        info!(
            "{} feed_detecting started, txn={:?}",
            self.cam.cam_ip,
            self.detecting_txn.lock().unwrap()
        );
    }

    /// `extend_timer(duration_sec)`. Only valid while feeding; never resets
    /// `detecting_txn` or frame counters.
    pub fn extend_timer(&self, duration_sec: u64) {
        if !self.status.is_feeding() {
            return;
        }
        *self.feed_deadline.lock().unwrap() =
            Some(Instant::now() + Duration::from_secs(duration_sec));
        debug!("{} extend_timer to {duration_sec}s", self.cam.cam_ip);
    }

    /// `stop_feeding()`.
    pub fn stop_feeding(&self) {
        if !self.status.is_feeding.swap(false, Ordering::SeqCst) {
            return;
        }
        *self.feed_deadline.lock().unwrap() = None;
        self.pushed_since_feed.store(0, Ordering::SeqCst);
        self.frame_store.pts_metadata.clear();

        let _ = self.decode_src.end_of_stream();
        let _ = self.decode_pipeline.seek_simple(
            gst::SeekFlags::FLUSH,
            gst::ClockTime::ZERO,
        );
        let _ = self.decode_pipeline.set_state(gst::State::Playing);

        if let Some(txn) = self.detecting_txn.lock().unwrap().take() {
            let _ = self.detector_tx.try_send(DetectorQueueItem::SessionEnd {
                cam_ip: self.cam.cam_ip.clone(),
                detecting_txn: txn,
            });
        }
        info!("{} stop_feeding", self.cam.cam_ip);
    }

    pub fn detecting_txn(&self) -> Option<Uuid> {
        *self.detecting_txn.lock().unwrap()
    }

    /// `start_recording(utc_iso)`. A second call while already recording is
    /// a no-op, returning `false`.
    pub fn start_recording(&self, utc_iso: String) -> bool {
        let mut rec = self.recording.lock().unwrap();
        if rec.is_some() {
            return false;
        }
        *rec = Some(RecordingMeta {
            start_utc: utc_iso,
        });
        self.status.is_recording.store(true, Ordering::SeqCst);
        true
    }

    /// `stop_recording(utc_iso)`. Spawns a save job that drains the
    /// pre-buffer from the recording's start timestamp through now and muxes
    /// it into an mp4, then emits a `VideoClipped` output record.
    pub fn stop_recording(self: &Arc<Self>, utc_iso: String) {
        let Some(meta) = self.recording.lock().unwrap().take() else {
            return;
        };
        self.status.is_recording.store(false, Ordering::SeqCst);

        let cam_ip = self.cam.cam_ip.clone();
        let codec = self.cam.codec;
        let video_root = self.video_root.clone();
        let frame_store = self.frame_store.clone();
        let output_tx = self.output_tx.clone();
        let start_utc = meta.start_utc;
        let end_utc = utc_iso;

        std::thread::spawn(move || {
            let samples = frame_store.pre_buffer.snapshot();
            let record_start: DateTime<Utc> = start_utc
                .parse()
                .unwrap_or_else(|_| Utc::now());
            let record_end: DateTime<Utc> = end_utc.parse().unwrap_or_else(|_| Utc::now());

            let date_folder = record_start.format("%Y-%m-%d").to_string();
            let time_filename = record_start.format("%H:%M:%S").to_string();
            let dir = format!("{video_root}/{cam_ip}/{date_folder}");
            if let Err(e) = std::fs::create_dir_all(&dir) {
                error!("{cam_ip} failed to create video dir {dir}: {e}");
                return;
            }
            let local_path = format!("{dir}/{time_filename}.mp4");

            if let Err(e) = mux_samples_to_mp4(&samples, &local_path, codec) {
                error!("{cam_ip} failed to mux recording: {e}");
                return;
            }

            let video_key = format!("{cam_ip}/{date_folder}/{time_filename}.mp4");
            let record = OutputRecord::VideoClipped {
                cam_ip: cam_ip.clone(),
                local_path,
                video_key,
                record_start,
                record_end,
            };
            if output_tx.try_send(record).is_err() {
                error!("{cam_ip} output queue full, dropping video_clipped record");
            }
        });
    }

    /// `stop(force)`. Forced variant skips the drain/flush dance and nulls
    /// the pipelines immediately.
    pub fn stop(self: &Arc<Self>, force: bool) {
        *self.status.state.lock().unwrap() = SessionState::Stopping;
        self.stop_flag.store(true, Ordering::SeqCst);
        *self.feed_deadline.lock().unwrap() = None;

        if !force {
            let _ = self.decode_src.end_of_stream();
        }
        let _ = self.capture_pipeline.set_state(gst::State::Null);
        let _ = self.decode_pipeline.set_state(gst::State::Null);
        self.frame_store.pre_buffer.clear();
        self.frame_store.detecting_buffer.clear();
        self.frame_store.pts_metadata.clear();

        self.status.is_playing.store(false, Ordering::SeqCst);
        self.status.is_feeding.store(false, Ordering::SeqCst);
        *self.status.state.lock().unwrap() = SessionState::Stopped;

        let mut threads = self.threads.lock().unwrap();
        for handle in threads.drain(..) {
            let _ = handle.join();
        }
    }
}

/// Muxes raw encoded samples into an mp4 container via a short-lived
/// GStreamer pipeline (`appsrc ! parse ! mp4mux ! filesink`), the same shape
/// `save_frames_as_video` uses in the source: a dedicated mux pipeline per
/// clip rather than reusing the capture/decode pipelines.
fn mux_samples_to_mp4(samples: &[EncodedFrame], out_path: &str, codec: Codec) -> Result<(), StreamError> {
    let (_, parse_element, _) = depay_parse_decoder(codec);
    let desc = format!(
        "appsrc name=mux_src format=time is-live=false \
         ! {parse_element} \
         ! mp4mux \
         ! filesink location={out_path}"
    );
    let pipeline = gst::parse::launch(&desc)
        .map_err(|e| StreamError::PipelineBuild(e.to_string()))?
        .downcast::<gst::Pipeline>()
        .map_err(|_| StreamError::PipelineBuild("mux pipeline is not a Pipeline".into()))?;
    let src = pipeline
        .by_name("mux_src")
        .ok_or_else(|| StreamError::PipelineBuild("missing mux_src".into()))?
        .downcast::<gst_app::AppSrc>()
        .map_err(|_| StreamError::PipelineBuild("mux_src is not an AppSrc".into()))?;

    pipeline
        .set_state(gst::State::Playing)
        .map_err(|e| StreamError::PipelineBuild(e.to_string()))?;

    let base = samples.first().map(|f| f.timestamp);
    for sample in samples {
        let pts_nanos = base
            .and_then(|b| sample.timestamp.duration_since(b).ok())
            .map(|d| d.as_nanos() as u64)
            .unwrap_or(0);
        let mut buffer = gst::Buffer::from_mut_slice(sample.data.clone());
        {
            let buf = buffer.get_mut().expect("sole owner of fresh buffer");
            buf.set_pts(gst::ClockTime::from_nseconds(pts_nanos));
        }
        let _ = src.push_buffer(buffer);
    }
    let _ = src.end_of_stream();

    if let Some(bus) = pipeline.bus() {
        bus.timed_pop_filtered(
            gst::ClockTime::from_seconds(10),
            &[gst::MessageType::Eos, gst::MessageType::Error],
        );
    }
    let _ = pipeline.set_state(gst::State::Null);
    Ok(())
}
