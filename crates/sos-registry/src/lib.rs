#![forbid(unsafe_code)]
#![deny(missing_docs)]

//! **sos-registry** – Worker records, reputation tiers, earnings.
//!
//! The registry is the exclusive owner of worker records. Records are
//! created on first `register`, mutated only through completion/failure
//! events (tier is recomputed on every mutation), and never deleted:
//! retirement sets a flag, and only long-retired tombstones are collected
//! by maintenance. State persists to a single `registry.json`, written via
//! the same temp-then-rename discipline as the task store.

use std::collections::HashMap;
use std::path::{Path, PathBuf};

use chrono::{Duration, Utc};
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use sos_types::{SosError, SosResult, WorkerId, WorkerRecord, WorkerTier};

/// The on-disk worker registry.
pub struct WorkerRegistry {
    path: PathBuf,
    workers: RwLock<HashMap<WorkerId, WorkerRecord>>,
}

impl WorkerRegistry {
    /// Open the registry file at `path`, loading existing records.
    pub async fn open<P: AsRef<Path>>(path: P) -> SosResult<Self> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .map_err(|e| SosError::Internal(format!("create registry dir: {e}")))?;
        }
        let workers = match tokio::fs::read(&path).await {
            Ok(bytes) => serde_json::from_slice::<Vec<WorkerRecord>>(&bytes)
                .map_err(|e| SosError::Internal(format!("corrupt registry: {e}")))?
                .into_iter()
                .map(|record| (record.id.clone(), record))
                .collect(),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => HashMap::new(),
            Err(e) => return Err(SosError::Internal(format!("read registry: {e}"))),
        };
        info!(path = %path.display(), workers = workers.len(), "worker registry opened");
        Ok(Self {
            path,
            workers: RwLock::new(workers),
        })
    }

    async fn persist(&self, workers: &HashMap<WorkerId, WorkerRecord>) -> SosResult<()> {
        let mut records: Vec<&WorkerRecord> = workers.values().collect();
        records.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        let bytes = serde_json::to_vec_pretty(&records)
            .map_err(|e| SosError::Internal(format!("serialize registry: {e}")))?;
        let tmp = self
            .path
            .with_file_name(format!(".registry.{}.tmp", Uuid::new_v4().simple()));
        tokio::fs::write(&tmp, &bytes)
            .await
            .map_err(|e| SosError::Internal(format!("write registry temp: {e}")))?;
        tokio::fs::rename(&tmp, &self.path)
            .await
            .map_err(|e| SosError::Internal(format!("rename registry: {e}")))?;
        Ok(())
    }

    /// Register a worker, or return the existing record unchanged.
    pub async fn register(&self, id: &str, name: &str) -> SosResult<WorkerRecord> {
        let id = WorkerId::new(id);
        let mut workers = self.workers.write().await;
        if let Some(existing) = workers.get(&id) {
            return Ok(existing.clone());
        }
        let record = WorkerRecord::new(id.clone(), name);
        workers.insert(id.clone(), record.clone());
        self.persist(&workers).await?;
        debug!(worker = %id, name, "worker registered");
        Ok(record)
    }

    /// Record a completed task with its earnings; recomputes the tier.
    pub async fn record_completion(&self, id: &str, earnings: u64) -> SosResult<WorkerRecord> {
        self.mutate(id, |record| record.record_completion(earnings))
            .await
    }

    /// Record a failed task; recomputes the tier.
    pub async fn record_failure(&self, id: &str) -> SosResult<WorkerRecord> {
        self.mutate(id, WorkerRecord::record_failure).await
    }

    /// Mark a worker retired; its record survives as a tombstone.
    pub async fn retire(&self, id: &str) -> SosResult<WorkerRecord> {
        self.mutate(id, |record| {
            record.retired = true;
            record.updated_at = Utc::now();
        })
        .await
    }

    async fn mutate(
        &self,
        id: &str,
        f: impl FnOnce(&mut WorkerRecord),
    ) -> SosResult<WorkerRecord> {
        let id = WorkerId::new(id);
        let mut workers = self.workers.write().await;
        let record = workers
            .get_mut(&id)
            .ok_or_else(|| SosError::NotFound(format!("worker {id}")))?;
        f(record);
        let snapshot = record.clone();
        self.persist(&workers).await?;
        Ok(snapshot)
    }

    /// Fetch one record.
    pub async fn get(&self, id: &str) -> SosResult<WorkerRecord> {
        let workers = self.workers.read().await;
        workers
            .get(&WorkerId::new(id))
            .cloned()
            .ok_or_else(|| SosError::NotFound(format!("worker {id}")))
    }

    /// List records, optionally filtered by tier, sorted by id.
    pub async fn list(&self, tier: Option<WorkerTier>) -> Vec<WorkerRecord> {
        let workers = self.workers.read().await;
        let mut records: Vec<WorkerRecord> = workers
            .values()
            .filter(|record| tier.map(|t| record.tier == t).unwrap_or(true))
            .cloned()
            .collect();
        records.sort_by(|a, b| a.id.as_str().cmp(b.id.as_str()));
        records
    }

    /// Collect tombstones: drop retired records idle longer than
    /// `older_than`. Active workers are never touched.
    pub async fn prune_tombstoned(&self, older_than: Duration) -> SosResult<usize> {
        let cutoff = Utc::now() - older_than;
        let mut workers = self.workers.write().await;
        let before = workers.len();
        workers.retain(|_, record| !(record.retired && record.updated_at < cutoff));
        let pruned = before - workers.len();
        if pruned > 0 {
            self.persist(&workers).await?;
            info!(pruned, "pruned tombstoned workers");
        }
        Ok(pruned)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    async fn registry() -> (TempDir, WorkerRegistry) {
        let dir = TempDir::new().unwrap();
        let registry = WorkerRegistry::open(dir.path().join("registry.json"))
            .await
            .unwrap();
        (dir, registry)
    }

    #[tokio::test]
    async fn register_is_idempotent() {
        let (_dir, registry) = registry().await;
        let first = registry.register("w-1", "atlas").await.unwrap();
        let second = registry.register("w-1", "renamed").await.unwrap();
        assert_eq!(first, second);
        assert_eq!(second.name, "atlas");
    }

    #[tokio::test]
    async fn mutations_recompute_tier_and_survive_reopen() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json");
        {
            let registry = WorkerRegistry::open(&path).await.unwrap();
            registry.register("w-1", "atlas").await.unwrap();
            for _ in 0..12 {
                registry.record_completion("w-1", 100_000).await.unwrap();
            }
            let record = registry.get("w-1").await.unwrap();
            assert_eq!(record.tier, WorkerTier::Apprentice);
            assert_eq!(record.total_earnings, 1_200_000);
        }
        // Reopen from disk.
        let registry = WorkerRegistry::open(&path).await.unwrap();
        let record = registry.get("w-1").await.unwrap();
        assert_eq!(record.tasks_completed, 12);
        assert_eq!(record.tier, WorkerTier::Apprentice);
    }

    #[tokio::test]
    async fn list_filters_by_tier() {
        let (_dir, registry) = registry().await;
        registry.register("novice", "n").await.unwrap();
        registry.register("veteran", "v").await.unwrap();
        for _ in 0..60 {
            registry.record_completion("veteran", 1).await.unwrap();
        }
        let journeymen = registry.list(Some(WorkerTier::Journeyman)).await;
        assert_eq!(journeymen.len(), 1);
        assert_eq!(journeymen[0].id.as_str(), "veteran");
        assert_eq!(registry.list(None).await.len(), 2);
    }

    #[tokio::test]
    async fn unknown_worker_is_not_found() {
        let (_dir, registry) = registry().await;
        assert!(matches!(
            registry.record_failure("ghost").await,
            Err(SosError::NotFound(_))
        ));
    }

    #[tokio::test]
    async fn prune_only_collects_old_tombstones() {
        let (_dir, registry) = registry().await;
        registry.register("active", "a").await.unwrap();
        registry.register("retired", "r").await.unwrap();
        registry.retire("retired").await.unwrap();

        // Freshly retired: kept.
        assert_eq!(registry.prune_tombstoned(Duration::days(30)).await.unwrap(), 0);
        // Zero grace: collected.
        assert_eq!(registry.prune_tombstoned(Duration::zero()).await.unwrap(), 1);
        assert!(registry.get("retired").await.is_err());
        assert!(registry.get("active").await.is_ok());
    }
}
