//! FrameBufferStore: per-camera rolling buffers plus the decoder PTS
//! correlation map. Grounded on `gstreamer_threading.py`'s
//! `add_recording_frame` / `add_detecting_frame` / `probe_callback`, adapted
//! into three independently-locked structures.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use parking_lot::Mutex;
use std::collections::VecDeque;
use std::time::{Duration, SystemTime};

use crate::models::EncodedFrame;

const METADATA_STORE_CAP: usize = 100;

/// A time-bounded FIFO of `(timestamp, sample)` entries. Used for both the
/// pre-buffer (`PRE_RECORDING_SEC` window) and the detecting-buffer
/// (`PRE_DETECTING_SEC` window) -- the two share identical eviction logic,
/// differing only in the window passed to `append`.
pub struct RollingBuffer {
    entries: Mutex<VecDeque<EncodedFrame>>,
}

impl RollingBuffer {
    pub fn new() -> Self {
        RollingBuffer {
            entries: Mutex::new(VecDeque::new()),
        }
    }

    /// Push `sample` at the tail. Unless `hold_eviction` is set (a recording
    /// job is in progress, for the pre-buffer case), evict entries older
    /// than `window` relative to `sample`'s timestamp.
    pub fn append(&self, sample: EncodedFrame, window: Duration, hold_eviction: bool) {
        let mut entries = self.entries.lock();
        let t = sample.timestamp;
        entries.push_back(sample);
        if hold_eviction {
            return;
        }
        while let Some(front) = entries.front() {
            match t.duration_since(front.timestamp) {
                Ok(age) if age > window => {
                    entries.pop_front();
                }
                _ => break,
            }
        }
    }

    /// Defensive copy of the current contents, suitable for handing to a
    /// save job without holding the lock for the duration of the write.
    pub fn snapshot(&self) -> Vec<EncodedFrame> {
        self.entries.lock().iter().cloned().collect()
    }

    /// Empty the buffer atomically with respect to `append`.
    pub fn clear(&self) {
        self.entries.lock().clear();
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Samples with `timestamp >= since`, in capture order -- used when
    /// assembling a recording clip that must span the pre-trigger window.
    pub fn since(&self, since: SystemTime) -> Vec<EncodedFrame> {
        self.entries
            .lock()
            .iter()
            .filter(|f| f.timestamp >= since)
            .cloned()
            .collect()
    }
}

impl Default for RollingBuffer {
    fn default() -> Self {
        Self::new()
    }
}

/// Maps decoder PTS (nanoseconds) to the capture wall-clock timestamp that
/// was stamped when the corresponding encoded sample was pushed into the
/// decode pipeline. Soft-capped at `METADATA_STORE_CAP` entries, evicting
/// the oldest insert first -- the exact policy `probe_callback` implements
/// to bound memory when decoded frames are dropped under load.
pub struct PtsMetadataStore {
    inner: Mutex<VecDeque<(u64, SystemTime)>>,
}

impl PtsMetadataStore {
    pub fn new() -> Self {
        PtsMetadataStore {
            inner: Mutex::new(VecDeque::with_capacity(METADATA_STORE_CAP)),
        }
    }

    pub fn insert(&self, pts_nanos: u64, capture_time: SystemTime) {
        let mut inner = self.inner.lock();
        if inner.len() >= METADATA_STORE_CAP {
            inner.pop_front();
        }
        inner.push_back((pts_nanos, capture_time));
    }

    pub fn lookup(&self, pts_nanos: u64) -> Option<SystemTime> {
        self.inner
            .lock()
            .iter()
            .find(|(pts, _)| *pts == pts_nanos)
            .map(|(_, t)| *t)
    }

    pub fn clear(&self) {
        self.inner.lock().clear();
    }
}

impl Default for PtsMetadataStore {
    fn default() -> Self {
        Self::new()
    }
}

/// The three buffers owned by one camera's FrameBufferStore, each guarded by
/// its own lock -- no operation in this module ever holds more than one at
/// once.
pub struct FrameBufferStore {
    pub pre_buffer: RollingBuffer,
    pub detecting_buffer: RollingBuffer,
    pub pts_metadata: PtsMetadataStore,
}

impl FrameBufferStore {
    pub fn new() -> Self {
        FrameBufferStore {
            pre_buffer: RollingBuffer::new(),
            detecting_buffer: RollingBuffer::new(),
            pts_metadata: PtsMetadataStore::new(),
        }
    }
}

impl Default for FrameBufferStore {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_at(t: SystemTime) -> EncodedFrame {
        EncodedFrame {
            data: vec![0u8; 4],
            timestamp: t,
            is_random_access_point: true,
        }
    }

    #[test]
    fn append_then_snapshot_round_trips() {
        let buf = RollingBuffer::new();
        let now = SystemTime::now();
        buf.append(sample_at(now), Duration::from_secs(5), false);
        let snap = buf.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].timestamp, now);
    }

    #[test]
    fn eviction_drops_entries_older_than_window() {
        let buf = RollingBuffer::new();
        let base = SystemTime::now();
        buf.append(sample_at(base), Duration::from_secs(5), false);
        buf.append(
            sample_at(base + Duration::from_secs(10)),
            Duration::from_secs(5),
            false,
        );
        let snap = buf.snapshot();
        assert_eq!(snap.len(), 1);
        assert_eq!(snap[0].timestamp, base + Duration::from_secs(10));
    }

    #[test]
    fn eviction_suppressed_while_recording_holds() {
        let buf = RollingBuffer::new();
        let base = SystemTime::now();
        buf.append(sample_at(base), Duration::from_secs(5), false);
        buf.append(
            sample_at(base + Duration::from_secs(10)),
            Duration::from_secs(5),
            true,
        );
        assert_eq!(buf.snapshot().len(), 2, "eviction must not run while a recording job holds the window");
    }

    #[test]
    fn pts_store_evicts_oldest_past_cap() {
        let store = PtsMetadataStore::new();
        let base = SystemTime::now();
        for i in 0..(METADATA_STORE_CAP as u64 + 10) {
            store.insert(i, base + Duration::from_millis(i));
        }
        assert!(store.lookup(0).is_none(), "oldest entries must be evicted past the soft cap");
        assert!(store.lookup(METADATA_STORE_CAP as u64 + 9).is_some());
    }
}
