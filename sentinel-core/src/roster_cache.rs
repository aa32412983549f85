//! RosterCache: periodic and forced refresh of the active-member list
//! from the external reservation/member store, pushed into the Detector
//! through the roster-setter contract.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use arc_swap::ArcSwap;
use log::{error, info};
use parking_lot::Mutex;

use crate::detector::{apply_roster_update, RosterMatrix};
use crate::models::{Member, MemberIdentity};

/// External source of member records (DynamoDB reads for reservations and
/// members in the original deployment); the core only needs this trait
/// boundary.
pub trait MemberStore: Send + Sync {
    fn list_active_members(&self) -> Result<Vec<Member>, anyhow::Error>;
}

pub struct RosterCache {
    store: Arc<dyn MemberStore>,
    roster: Arc<ArcSwap<RosterMatrix>>,
    last_identity: Arc<Mutex<HashSet<MemberIdentity>>>,
}

impl RosterCache {
    pub fn new(store: Arc<dyn MemberStore>, roster: Arc<ArcSwap<RosterMatrix>>) -> Self {
        RosterCache {
            store,
            roster,
            last_identity: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    /// Pull the current member list, drop entries with no `faceEmbedding`,
    /// and push into the Detector's roster if the identity set changed.
    pub fn refresh(&self) -> bool {
        let members = match self.store.list_active_members() {
            Ok(m) => m,
            Err(e) => {
                error!("roster refresh failed: {e}");
                return false;
            }
        };
        let filtered: Vec<Member> = members
            .into_iter()
            .filter(|m| !m.face_embedding.is_empty())
            .collect();
        let changed = apply_roster_update(&self.roster, &self.last_identity, filtered);
        if changed {
            info!("roster updated, {} active members", self.roster.load().members.len());
        }
        changed
    }

    /// Runs `refresh()` on a fixed cadence until `stop_flag` is set. A
    /// forced refresh (HTTP `/recognise` onboarding path) calls `refresh()`
    /// directly instead of waiting for the next tick.
    pub fn run_periodic(&self, period: Duration, stop_flag: &std::sync::atomic::AtomicBool) {
        while !stop_flag.load(std::sync::atomic::Ordering::SeqCst) {
            std::thread::sleep(period);
            self.refresh();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Mutex as StdMutex;

    struct FixedStore {
        members: StdMutex<Vec<Member>>,
    }

    impl MemberStore for FixedStore {
        fn list_active_members(&self) -> Result<Vec<Member>, anyhow::Error> {
            Ok(self.members.lock().unwrap().clone())
        }
    }

    fn member(no: &str) -> Member {
        Member {
            reservation_code: "R1".to_string(),
            member_no: no.to_string(),
            listing_id: "L1".to_string(),
            full_name: "Test".to_string(),
            key_notified: false,
            face_embedding: vec![0.1; 512],
        }
    }

    #[test]
    fn members_without_embedding_are_dropped() {
        let mut no_embedding = member("2");
        no_embedding.face_embedding.clear();
        let store = Arc::new(FixedStore {
            members: StdMutex::new(vec![member("1"), no_embedding]),
        });
        let roster = Arc::new(ArcSwap::from_pointee(RosterMatrix::empty()));
        let cache = RosterCache::new(store, roster.clone());
        cache.refresh();
        assert_eq!(roster.load().members.len(), 1);
    }

    #[test]
    fn unchanged_identity_set_is_a_no_op() {
        let store = Arc::new(FixedStore {
            members: StdMutex::new(vec![member("1")]),
        });
        let roster = Arc::new(ArcSwap::from_pointee(RosterMatrix::empty()));
        let cache = RosterCache::new(store, roster.clone());
        assert!(cache.refresh());
        assert!(!cache.refresh(), "second refresh with same roster must be a no-op");
    }
}
