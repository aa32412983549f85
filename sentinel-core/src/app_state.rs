//! AppState: the explicit struct that replaces every module-level
//! mutable global `py_handler.py` keeps -- queues, dictionaries, timers,
//! the detector reference, the HTTP server handle.
//! Built once at startup in the agent binary and handed around as `Arc`.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use std::sync::atomic::AtomicBool;
use std::sync::Arc;

use arc_swap::ArcSwap;
use crossbeam_channel::{Receiver, Sender};

use crate::camera_supervisor::CameraSupervisor;
use crate::config::Config;
use crate::detector::RosterMatrix;
use crate::match_handler::MatchHandler;
use crate::models::{DetectorQueueItem, OutputRecord};
use crate::roster_cache::RosterCache;
use crate::trigger_coordinator::{TriggerContextMap, TriggerCoordinator};

const CAM_QUEUE_CAPACITY: usize = 500;
const OUTPUT_QUEUE_CAPACITY: usize = 50;

/// Shared state handed to the HTTP handlers. The `detector_rx`/`output_rx`
/// halves of the channels `bounded_channels` allocates are not stored here:
/// they're moved straight into the `Detector` and output-worker threads at
/// startup, and nothing outside those threads ever reads from them.
pub struct AppState {
    pub config: Arc<ArcSwap<Config>>,
    pub roster: Arc<ArcSwap<RosterMatrix>>,
    pub trigger_contexts: Arc<TriggerContextMap>,
    pub trigger_coordinator: Arc<TriggerCoordinator>,
    pub supervisor: Arc<CameraSupervisor>,
    pub match_handler: Arc<MatchHandler>,
    pub roster_cache: Arc<RosterCache>,
    pub detector_tx: Sender<DetectorQueueItem>,
    pub output_tx: Sender<OutputRecord>,
    pub stop_flag: Arc<AtomicBool>,
}

impl AppState {
    /// Allocates the bounded queues (`cam_queue` 500, `scanner_output_queue`
    /// 50) and wires the construction order every binary must
    /// follow: channels, then context map, then coordinator, then the
    /// components that need a handle to the channels.
    pub fn bounded_channels() -> (
        Sender<DetectorQueueItem>,
        Receiver<DetectorQueueItem>,
        Sender<OutputRecord>,
        Receiver<OutputRecord>,
    ) {
        let (detector_tx, detector_rx) = crossbeam_channel::bounded(CAM_QUEUE_CAPACITY);
        let (output_tx, output_rx) = crossbeam_channel::bounded(OUTPUT_QUEUE_CAPACITY);
        (detector_tx, detector_rx, output_tx, output_rx)
    }

    /// Applies a `change_var` control message by swapping in a wholly new
    /// `Config` snapshot -- never a partial field mutation, the same
    /// all-or-nothing discipline the roster matrix uses.
    pub fn apply_change_var(&self, key: &str, value: &str) -> Result<(), crate::error::ConfigError> {
        let mut next = (**self.config.load()).clone();
        next.apply_override(key, value)?;
        self.config.store(Arc::new(next));
        Ok(())
    }
}
