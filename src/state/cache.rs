//! File-backed idempotency cache
//!
//! One in-process map is the only copy the relayer consults; the JSON file
//! is a serialized snapshot of it. Flushes are whole-file (temp file, then
//! rename) and serialized through a single lock.

use crate::error::{RelayerError, RelayerResult};
use crate::governance::{MainGovernance, ProposalId};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info, warn};

/// Local view of one proposal's progress
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProposalRecord {
    pub finalized: bool,
    pub executed: bool,
    pub status_synced: bool,
}

/// On-disk schema
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CacheFile {
    last_updated: Option<DateTime<Utc>>,
    #[serde(default)]
    proposals: BTreeMap<ProposalId, ProposalRecord>,
}

/// Cache summary
#[derive(Debug, Clone, Serialize)]
pub struct CacheStats {
    pub proposals: usize,
    pub finalized: usize,
    pub executed: usize,
    pub status_synced: usize,
    pub last_updated: Option<DateTime<Utc>>,
    pub needs_rebuild: bool,
}

/// Durable record of settled proposals. Never authoritative.
pub struct IdempotencyCache {
    path: PathBuf,
    state: RwLock<CacheFile>,
    flush_lock: Mutex<()>,
    needs_rebuild: AtomicBool,
}

impl IdempotencyCache {
    /// Load the cache file. A missing or unreadable file yields an empty
    /// cache flagged for rebuild.
    pub async fn open(path: impl AsRef<Path>) -> Self {
        let path = path.as_ref().to_path_buf();

        let (state, needs_rebuild) = match tokio::fs::read(&path).await {
            Ok(raw) => match serde_json::from_slice::<CacheFile>(&raw) {
                Ok(state) => {
                    info!(
                        "Loaded {} cached proposals from {:?}",
                        state.proposals.len(),
                        path
                    );
                    (state, false)
                }
                Err(e) => {
                    warn!("Cache file {:?} is unreadable ({}), will rebuild", path, e);
                    (CacheFile::default(), true)
                }
            },
            Err(e) => {
                warn!("Cache file {:?} not loaded ({}), will rebuild", path, e);
                (CacheFile::default(), true)
            }
        };

        crate::metrics::set_cache_size(state.proposals.len());

        Self {
            path,
            state: RwLock::new(state),
            flush_lock: Mutex::new(()),
            needs_rebuild: AtomicBool::new(needs_rebuild),
        }
    }

    pub fn needs_rebuild(&self) -> bool {
        self.needs_rebuild.load(Ordering::Acquire)
    }

    pub async fn get(&self, id: ProposalId) -> Option<ProposalRecord> {
        self.state.read().await.proposals.get(&id).copied()
    }

    /// Finalized and every mirror carries the final status
    pub async fn is_settled(&self, id: ProposalId) -> bool {
        self.get(id)
            .await
            .map(|r| r.finalized && r.status_synced)
            .unwrap_or(false)
    }

    pub async fn mark_finalized(&self, id: ProposalId) -> RelayerResult<()> {
        self.update(id, |r| r.finalized = true).await
    }

    pub async fn mark_executed(&self, id: ProposalId) -> RelayerResult<()> {
        self.update(id, |r| {
            r.finalized = true;
            r.executed = true;
        })
        .await
    }

    pub async fn mark_status_synced(&self, id: ProposalId) -> RelayerResult<()> {
        self.update(id, |r| {
            r.finalized = true;
            r.status_synced = true;
        })
        .await
    }

    /// Apply `f` to the record for `id`, flushing only if it changed
    async fn update(&self, id: ProposalId, f: impl FnOnce(&mut ProposalRecord)) -> RelayerResult<()> {
        let changed = {
            let mut state = self.state.write().await;
            let record = state.proposals.entry(id).or_default();
            let before = *record;
            f(record);
            let changed = *record != before;
            if changed {
                state.last_updated = Some(Utc::now());
            }
            changed
        };

        if changed {
            debug!("Cache record for proposal {} updated", id);
            self.flush().await?;
        }
        Ok(())
    }

    /// Re-derive finalized proposals from live main-chain flags
    pub async fn rebuild(&self, main: &dyn MainGovernance) -> RelayerResult<usize> {
        let ids = main.proposal_ids().await?;
        let mut proposals = BTreeMap::new();
        let mut complete = true;

        for id in ids {
            match main.proposal(id).await {
                Ok(p) if p.vote_tally_finalized => {
                    proposals.insert(
                        id,
                        ProposalRecord {
                            finalized: true,
                            executed: p.executed,
                            status_synced: false,
                        },
                    );
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("Cache rebuild could not read proposal {}: {}", id, e);
                    complete = false;
                }
            }
        }

        let count = proposals.len();
        {
            let mut state = self.state.write().await;
            state.proposals = proposals;
            state.last_updated = Some(Utc::now());
        }
        self.flush().await?;
        self.needs_rebuild.store(!complete, Ordering::Release);

        info!("Cache rebuilt with {} finalized proposals", count);
        Ok(count)
    }

    pub async fn stats(&self) -> CacheStats {
        let state = self.state.read().await;
        let records = state.proposals.values();
        CacheStats {
            proposals: state.proposals.len(),
            finalized: records.clone().filter(|r| r.finalized).count(),
            executed: records.clone().filter(|r| r.executed).count(),
            status_synced: records.filter(|r| r.status_synced).count(),
            last_updated: state.last_updated,
            needs_rebuild: self.needs_rebuild(),
        }
    }

    /// Write the whole map to disk (temp file, then rename)
    pub async fn flush(&self) -> RelayerResult<()> {
        let _guard = self.flush_lock.lock().await;

        let (raw, size) = {
            let state = self.state.read().await;
            let raw = serde_json::to_vec_pretty(&*state)
                .map_err(|e| RelayerError::Cache(format!("serialize: {}", e)))?;
            (raw, state.proposals.len())
        };

        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent)
                    .await
                    .map_err(|e| RelayerError::Cache(format!("create {:?}: {}", parent, e)))?;
            }
        }

        let tmp = self.path.with_extension("json.tmp");
        tokio::fs::write(&tmp, &raw)
            .await
            .map_err(|e| RelayerError::Cache(format!("write {:?}: {}", tmp, e)))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| RelayerError::Cache(format!("rename {:?}: {}", self.path, e)))?;

        crate::metrics::set_cache_size(size);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockMain;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_missing_file_flags_rebuild() {
        let dir = tempdir().unwrap();
        let cache = IdempotencyCache::open(dir.path().join("state.json")).await;
        assert!(cache.needs_rebuild());
        assert_eq!(cache.stats().await.proposals, 0);
    }

    #[tokio::test]
    async fn test_corrupt_file_flags_rebuild() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        std::fs::write(&path, b"{ not json").unwrap();

        let cache = IdempotencyCache::open(&path).await;
        assert!(cache.needs_rebuild());
    }

    #[tokio::test]
    async fn test_records_survive_reopen() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("nested").join("state.json");

        let cache = IdempotencyCache::open(&path).await;
        cache.mark_finalized(1).await.unwrap();
        cache.mark_executed(2).await.unwrap();
        cache.mark_status_synced(2).await.unwrap();

        let reopened = IdempotencyCache::open(&path).await;
        assert!(!reopened.needs_rebuild());
        assert_eq!(
            reopened.get(1).await,
            Some(ProposalRecord {
                finalized: true,
                executed: false,
                status_synced: false,
            })
        );
        assert!(reopened.is_settled(2).await);
        assert!(!reopened.is_settled(1).await);
        assert!(reopened.stats().await.last_updated.is_some());
    }

    #[tokio::test]
    async fn test_file_schema_is_camel_case() {
        let dir = tempdir().unwrap();
        let path = dir.path().join("state.json");
        let cache = IdempotencyCache::open(&path).await;
        cache.mark_status_synced(9).await.unwrap();

        let raw: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&path).unwrap()).unwrap();
        assert!(raw["lastUpdated"].is_string());
        assert_eq!(raw["proposals"]["9"]["statusSynced"], true);
        assert_eq!(raw["proposals"]["9"]["finalized"], true);
    }

    #[tokio::test]
    async fn test_rebuild_keeps_only_finalized() {
        let dir = tempdir().unwrap();
        let main = MockMain::new(1, vec![137]);
        main.add_proposal(1, 0, 100);
        main.add_proposal(2, 0, 10_000);
        main.set_time(200);
        main.force_finalized(1, true);

        let cache = IdempotencyCache::open(dir.path().join("state.json")).await;
        let count = cache.rebuild(&main).await.unwrap();

        assert_eq!(count, 1);
        assert!(!cache.needs_rebuild());
        assert_eq!(
            cache.get(1).await,
            Some(ProposalRecord {
                finalized: true,
                executed: true,
                status_synced: false,
            })
        );
        assert_eq!(cache.get(2).await, None);
    }
}
