//! Task identity and on-disk artifact reuse.
//!
//! Every render gets a task id for the duration of its execution. File-mode renders
//! write `<task id>.html`, so a completed artifact is recognisable by its stem no longer
//! being active. Such files can be claimed through the reuse lock and overwritten by a
//! new task instead of creating fresh files on every render.

use crate::utils::sanitize_task_name;
use crate::RenderError;
use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::{DashMap, DashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, SystemTime};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Artifacts younger than this are never reused, their writer may still be flushing.
pub const DEFAULT_REUSE_MIN_AGE: Duration = Duration::from_secs(5);

const ARTIFACT_EXTENSION: &str = "html";

#[derive(Debug, Default)]
struct RegistryInner {
    active: DashMap<String, DateTime<Utc>>,
    reuse_locks: DashSet<PathBuf>,
    cleanup_timers: DashMap<PathBuf, JoinHandle<()>>,
}

impl Drop for RegistryInner {
    fn drop(&mut self) {
        for timer in self.cleanup_timers.iter() {
            timer.value().abort();
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct TaskRegistry {
    inner: Arc<RegistryInner>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Issues and registers a fresh id of the form `name_<base36 time>_<random>`.
    pub fn create_task(&self, name: &str) -> String {
        let name = sanitize_task_name(name);

        loop {
            let millis = Utc::now().timestamp_millis().rem_euclid(1_000_000) as u64;
            let id = format!("{}_{}_{}", name, to_base36(millis), random_suffix());

            if let Entry::Vacant(slot) = self.inner.active.entry(id.clone()) {
                slot.insert(Utc::now());
                debug!("Task created: {}", id);
                return id;
            }
        }
    }

    /// Retires a task. Unknown ids are ignored.
    pub fn cleanup_task(&self, task_id: &str) {
        if self.inner.active.remove(task_id).is_some() {
            debug!("Task retired: {}", task_id);
        }
    }

    pub fn is_active(&self, task_id: &str) -> bool {
        self.inner.active.contains_key(task_id)
    }

    pub fn active_count(&self) -> usize {
        self.inner.active.len()
    }

    pub fn created_at(&self, task_id: &str) -> Option<DateTime<Utc>> {
        self.inner.active.get(task_id).map(|entry| *entry.value())
    }

    pub fn is_locked(&self, path: &Path) -> bool {
        self.inner.reuse_locks.contains(path)
    }

    pub async fn find_and_lock_reusable_file(
        &self,
        target_dir: &Path,
    ) -> Result<Option<PathBuf>, RenderError> {
        self.find_and_lock_reusable_file_with_age(target_dir, DEFAULT_REUSE_MIN_AGE)
            .await
    }

    /// Claims the oldest completed artifact in `target_dir` for overwrite.
    ///
    /// A file qualifies when its stem is not an active task, it is not already claimed
    /// and it is older than `min_age`. The caller owns the claim until it calls
    /// [`TaskRegistry::release_reusable_lock`].
    pub async fn find_and_lock_reusable_file_with_age(
        &self,
        target_dir: &Path,
        min_age: Duration,
    ) -> Result<Option<PathBuf>, RenderError> {
        let artifacts = list_artifacts(target_dir).await?;
        let now = SystemTime::now();

        for (path, modified) in artifacts {
            let stem = artifact_stem(&path);
            if self.is_active(stem) || self.is_locked(&path) {
                continue;
            }

            let age = now.duration_since(modified).unwrap_or_default();
            if age <= min_age {
                continue;
            }

            if !self.inner.reuse_locks.insert(path.clone()) {
                continue;
            }

            // The task may have been re-registered between the scan and the claim.
            if self.is_active(stem) {
                self.inner.reuse_locks.remove(&path);
                continue;
            }

            debug!("Locked artifact for reuse: {}", path.display());
            return Ok(Some(path));
        }

        Ok(None)
    }

    pub fn release_reusable_lock(&self, path: &Path) {
        self.inner.reuse_locks.remove(path);
    }

    /// Deletes completed artifacts beyond the `keep_count` most recent ones.
    ///
    /// Active and claimed artifacts are neither counted nor deleted. Returns the number of
    /// files removed.
    pub async fn cleanup_completed_files(
        &self,
        target_dir: &Path,
        keep_count: usize,
    ) -> Result<usize, RenderError> {
        let completed: Vec<PathBuf> = list_artifacts(target_dir)
            .await?
            .into_iter()
            .map(|(path, _)| path)
            .filter(|path| !self.is_active(artifact_stem(path)) && !self.is_locked(path))
            .collect();

        if completed.len() <= keep_count {
            return Ok(0);
        }

        let excess = completed.len() - keep_count;
        let mut removed = 0;

        for path in completed.into_iter().take(excess) {
            if self.is_locked(&path) || self.is_active(artifact_stem(&path)) {
                continue;
            }

            match tokio::fs::remove_file(&path).await {
                Ok(()) => removed += 1,
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => warn!("Failed to remove artifact {}: {}", path.display(), e),
            }
        }

        if removed > 0 {
            info!(
                "Removed {} completed artifacts from {}",
                removed,
                target_dir.display()
            );
        }

        Ok(removed)
    }

    /// Runs [`TaskRegistry::cleanup_completed_files`] on `target_dir` every `interval`.
    ///
    /// Returns false when a timer for this directory is already running.
    pub fn start_cleanup_timer(
        &self,
        target_dir: &Path,
        interval: Duration,
        keep_count: usize,
    ) -> bool {
        let slot = match self.inner.cleanup_timers.entry(target_dir.to_path_buf()) {
            Entry::Occupied(_) => return false,
            Entry::Vacant(slot) => slot,
        };

        let weak: Weak<RegistryInner> = Arc::downgrade(&self.inner);
        let dir = target_dir.to_path_buf();

        let handle = tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;

            loop {
                ticker.tick().await;

                let Some(inner) = weak.upgrade() else {
                    break;
                };
                let registry = TaskRegistry { inner };

                if let Err(e) = registry.cleanup_completed_files(&dir, keep_count).await {
                    warn!("Artifact cleanup failed for {}: {}", dir.display(), e);
                }
            }
        });

        slot.insert(handle);
        info!(
            "Artifact cleanup timer started for {} (every {:?}, keep {})",
            target_dir.display(),
            interval,
            keep_count
        );
        true
    }

    pub fn stop_cleanup_timers(&self) {
        self.inner.cleanup_timers.retain(|_, handle| {
            handle.abort();
            false
        });
    }

    pub fn cleanup_timer_count(&self) -> usize {
        self.inner.cleanup_timers.len()
    }
}

fn artifact_stem(path: &Path) -> &str {
    path.file_stem().and_then(|stem| stem.to_str()).unwrap_or("")
}

/// `*.html` files in `dir`, oldest first. A missing directory has no artifacts.
async fn list_artifacts(dir: &Path) -> Result<Vec<(PathBuf, SystemTime)>, RenderError> {
    let mut entries = match tokio::fs::read_dir(dir).await {
        Ok(entries) => entries,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut artifacts = Vec::new();
    while let Some(entry) = entries.next_entry().await? {
        let path = entry.path();
        if path.extension().and_then(|ext| ext.to_str()) != Some(ARTIFACT_EXTENSION) {
            continue;
        }

        let metadata = match entry.metadata().await {
            Ok(metadata) if metadata.is_file() => metadata,
            _ => continue,
        };
        let modified = metadata.modified().unwrap_or(SystemTime::UNIX_EPOCH);
        artifacts.push((path, modified));
    }

    artifacts.sort_by(|a, b| a.1.cmp(&b.1).then_with(|| a.0.cmp(&b.0)));
    Ok(artifacts)
}

fn to_base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789abcdefghijklmnopqrstuvwxyz";

    if value == 0 {
        return "0".to_string();
    }

    let mut out = Vec::new();
    while value > 0 {
        out.push(DIGITS[(value % 36) as usize]);
        value /= 36;
    }
    out.reverse();
    String::from_utf8_lossy(&out).into_owned()
}

fn random_suffix() -> String {
    let random = u128::from_le_bytes(*uuid::Uuid::new_v4().as_bytes());
    let suffix = to_base36((random % (36u128.pow(4))) as u64);
    format!("{suffix:0>4}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashSet;
    use tempfile::TempDir;

    fn write_artifact(dir: &Path, name: &str, age: Duration) -> PathBuf {
        let path = dir.join(name);
        std::fs::write(&path, "<html></html>").unwrap();
        let file = std::fs::File::options().write(true).open(&path).unwrap();
        file.set_modified(SystemTime::now() - age).unwrap();
        path
    }

    #[test]
    fn test_base36() {
        assert_eq!(to_base36(0), "0");
        assert_eq!(to_base36(35), "z");
        assert_eq!(to_base36(36), "10");
        assert_eq!(random_suffix().len(), 4);
    }

    #[test]
    fn test_create_task_unique() {
        let registry = TaskRegistry::new();
        let ids: HashSet<String> = (0..500).map(|_| registry.create_task("card")).collect();

        assert_eq!(ids.len(), 500);
        assert_eq!(registry.active_count(), 500);
        for id in &ids {
            let parts: Vec<&str> = id.split('_').collect();
            assert_eq!(parts.len(), 3);
            assert_eq!(parts[0], "card");
            assert_eq!(parts[2].len(), 4);
        }
    }

    #[test]
    fn test_cleanup_task_idempotent() {
        let registry = TaskRegistry::new();
        let id = registry.create_task("a");
        let other = registry.create_task("b");

        registry.cleanup_task(&id);
        registry.cleanup_task(&id);
        assert!(!registry.is_active(&id));
        assert!(registry.is_active(&other));
        assert_eq!(registry.active_count(), 1);

        registry.cleanup_task("never-issued");
        assert_eq!(registry.active_count(), 1);
    }

    #[tokio::test]
    async fn test_reuse_skips_young_active_and_locked() {
        let dir = TempDir::new().unwrap();
        let registry = TaskRegistry::new();
        let active = registry.create_task("busy");

        write_artifact(dir.path(), &format!("{active}.html"), Duration::from_secs(60));
        write_artifact(dir.path(), "young.html", Duration::from_secs(1));
        write_artifact(dir.path(), "notes.txt", Duration::from_secs(60));
        let oldest = write_artifact(dir.path(), "done_a.html", Duration::from_secs(120));
        let older = write_artifact(dir.path(), "done_b.html", Duration::from_secs(90));

        let first = registry.find_and_lock_reusable_file(dir.path()).await.unwrap();
        assert_eq!(first.as_deref(), Some(oldest.as_path()));

        let second = registry.find_and_lock_reusable_file(dir.path()).await.unwrap();
        assert_eq!(second.as_deref(), Some(older.as_path()));

        let third = registry.find_and_lock_reusable_file(dir.path()).await.unwrap();
        assert!(third.is_none());

        registry.release_reusable_lock(&oldest);
        registry.release_reusable_lock(&oldest);
        let again = registry.find_and_lock_reusable_file(dir.path()).await.unwrap();
        assert_eq!(again.as_deref(), Some(oldest.as_path()));
    }

    #[tokio::test]
    async fn test_reuse_missing_directory() {
        let dir = TempDir::new().unwrap();
        let registry = TaskRegistry::new();
        let found = registry
            .find_and_lock_reusable_file(&dir.path().join("absent"))
            .await
            .unwrap();
        assert!(found.is_none());
    }

    #[tokio::test]
    async fn test_cleanup_keeps_most_recent() {
        let dir = TempDir::new().unwrap();
        let registry = TaskRegistry::new();
        let active = registry.create_task("live");

        let a = write_artifact(dir.path(), "a.html", Duration::from_secs(500));
        let b = write_artifact(dir.path(), "b.html", Duration::from_secs(400));
        let c = write_artifact(dir.path(), "c.html", Duration::from_secs(300));
        let d = write_artifact(dir.path(), "d.html", Duration::from_secs(200));
        let live = write_artifact(dir.path(), &format!("{active}.html"), Duration::from_secs(900));

        let locked = registry
            .find_and_lock_reusable_file(dir.path())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(locked, a);

        let removed = registry.cleanup_completed_files(dir.path(), 2).await.unwrap();
        assert_eq!(removed, 1);
        assert!(a.exists());
        assert!(!b.exists());
        assert!(c.exists() && d.exists());
        assert!(live.exists());

        assert_eq!(registry.cleanup_completed_files(dir.path(), 2).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_cleanup_timer_starts_once() {
        let dir = TempDir::new().unwrap();
        let registry = TaskRegistry::new();

        assert!(registry.start_cleanup_timer(dir.path(), Duration::from_secs(300), 2));
        assert!(!registry.start_cleanup_timer(dir.path(), Duration::from_secs(60), 5));
        assert_eq!(registry.cleanup_timer_count(), 1);

        registry.stop_cleanup_timers();
        assert_eq!(registry.cleanup_timer_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_reuse_has_one_winner() {
        let registry = TaskRegistry::new();

        for round in 0..50 {
            let dir = TempDir::new().unwrap();
            let eligible = write_artifact(
                dir.path(),
                &format!("done_{round}.html"),
                Duration::from_secs(60),
            );

            let claim = |registry: TaskRegistry, dir: PathBuf| {
                tokio::spawn(async move { registry.find_and_lock_reusable_file(&dir).await })
            };
            let (a, b) = tokio::join!(
                claim(registry.clone(), dir.path().to_path_buf()),
                claim(registry.clone(), dir.path().to_path_buf()),
            );
            let claims = [a.unwrap().unwrap(), b.unwrap().unwrap()];

            let winners: Vec<&PathBuf> = claims.iter().flatten().collect();
            assert_eq!(winners, vec![&eligible], "round {round}");
            assert!(registry.is_locked(&eligible));
            registry.release_reusable_lock(&eligible);
        }
    }
}
