use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use crate::credential::Credential;
use crate::upstream::AccountId;

const TASK_EXT: &str = "json";

/// A persisted keepalive obligation for one account.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    pub uuid: Uuid,
    pub account_id: AccountId,
    pub credential: Credential,
    pub notify_target: i64,
    #[serde(default)]
    pub consecutive_failures: u32,
    pub created_at_ms: u64,
    /// Time of the last successful heartbeat.
    #[serde(default)]
    pub last_heartbeat_ms: Option<u64>,
}

impl Task {
    pub fn new(account_id: AccountId, credential: Credential, notify_target: i64) -> Self {
        Self {
            uuid: Uuid::new_v4(),
            account_id,
            credential,
            notify_target,
            consecutive_failures: 0,
            created_at_ms: now_ms(),
            last_heartbeat_ms: None,
        }
    }
}

/// Outcome of loading the task directory at startup.
#[derive(Debug, Default)]
pub struct LoadReport {
    /// Older tasks dropped because a newer one exists for the same account.
    pub displaced: Vec<Task>,
    /// Files that could not be read or parsed.
    pub errors: usize,
}

#[derive(Default)]
struct Inner {
    by_uuid: HashMap<Uuid, Task>,
    by_account: HashMap<AccountId, Uuid>,
}

impl Inner {
    fn insert(&mut self, task: Task) {
        self.by_account.insert(task.account_id, task.uuid);
        self.by_uuid.insert(task.uuid, task);
    }

    fn remove(&mut self, uuid: &Uuid) -> Option<Task> {
        let task = self.by_uuid.remove(uuid)?;
        if self.by_account.get(&task.account_id) == Some(uuid) {
            self.by_account.remove(&task.account_id);
        }
        Some(task)
    }
}

/// File-backed task records, one `{uuid}.json` per task.
///
/// Every mutation writes the record to a temporary file and renames it into
/// place while holding the store lock, so the in-memory maps and the
/// directory never disagree about which tasks exist.
pub struct TaskStore {
    dir: PathBuf,
    inner: Mutex<Inner>,
}

impl TaskStore {
    /// Load every task under `dir`, creating the directory if needed.
    ///
    /// When several files belong to the same account the newest one wins and
    /// the others are deleted and returned in [`LoadReport::displaced`].
    pub fn open(dir: &Path) -> Result<(Self, LoadReport)> {
        std::fs::create_dir_all(dir)
            .with_context(|| format!("failed to create data dir {}", dir.display()))?;

        let mut report = LoadReport::default();
        let mut loaded = Vec::new();
        let entries = std::fs::read_dir(dir)
            .with_context(|| format!("failed to read data dir {}", dir.display()))?;
        for entry in entries {
            let path = entry.context("failed to read dir entry")?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(TASK_EXT) {
                continue;
            }
            match read_task(&path) {
                Ok(task) => loaded.push(task),
                Err(e) => {
                    warn!(path = %path.display(), "skipping unreadable task file: {e:#}");
                    report.errors += 1;
                }
            }
        }

        // Newest first so the first task seen per account is the keeper.
        loaded.sort_by(|a, b| b.created_at_ms.cmp(&a.created_at_ms));
        let mut inner = Inner::default();
        for task in loaded {
            if inner.by_account.contains_key(&task.account_id) {
                if let Err(e) = remove_task_file(dir, &task.uuid) {
                    warn!(uuid = %task.uuid, "failed to delete duplicate task: {e:#}");
                }
                report.displaced.push(task);
            } else {
                inner.insert(task);
            }
        }

        info!(
            tasks = inner.by_uuid.len(),
            duplicates = report.displaced.len(),
            errors = report.errors,
            "task store loaded"
        );
        Ok((
            Self {
                dir: dir.to_path_buf(),
                inner: Mutex::new(inner),
            },
            report,
        ))
    }

    pub async fn get(&self, uuid: &Uuid) -> Option<Task> {
        self.inner.lock().await.by_uuid.get(uuid).cloned()
    }

    pub async fn get_by_account(&self, account_id: AccountId) -> Option<Task> {
        let inner = self.inner.lock().await;
        let uuid = inner.by_account.get(&account_id)?;
        inner.by_uuid.get(uuid).cloned()
    }

    pub async fn list(&self) -> Vec<Task> {
        let mut tasks: Vec<Task> = self.inner.lock().await.by_uuid.values().cloned().collect();
        tasks.sort_by_key(|t| t.created_at_ms);
        tasks
    }

    pub async fn len(&self) -> usize {
        self.inner.lock().await.by_uuid.len()
    }

    /// Persist `task`, atomically displacing any task for the same account.
    ///
    /// Returns the displaced task, if there was one.
    pub async fn insert_replacing(&self, task: Task) -> Result<Option<Task>> {
        let mut inner = self.inner.lock().await;
        write_task(&self.dir, &task)?;

        let previous_uuid = inner
            .by_account
            .get(&task.account_id)
            .copied()
            .filter(|old| *old != task.uuid);
        let previous = previous_uuid.and_then(|old| inner.remove(&old));
        if let Some(old) = &previous {
            // A leftover file is resolved by de-duplication on the next start.
            if let Err(e) = remove_task_file(&self.dir, &old.uuid) {
                warn!(uuid = %old.uuid, "failed to delete replaced task file: {e:#}");
            }
        }
        inner.insert(task);
        Ok(previous)
    }

    /// Delete a task. Returns `None` if it does not exist.
    pub async fn remove(&self, uuid: &Uuid) -> Result<Option<Task>> {
        let mut inner = self.inner.lock().await;
        if !inner.by_uuid.contains_key(uuid) {
            return Ok(None);
        }
        remove_task_file(&self.dir, uuid)?;
        Ok(inner.remove(uuid))
    }

    /// Reset the failure counter after a successful heartbeat.
    pub async fn record_success(&self, uuid: &Uuid, at_ms: u64) -> Result<Option<Task>> {
        self.update(uuid, |task| {
            task.consecutive_failures = 0;
            task.last_heartbeat_ms = Some(at_ms);
        })
        .await
    }

    /// Increment the failure counter. Returns the updated task.
    pub async fn record_failure(&self, uuid: &Uuid) -> Result<Option<Task>> {
        self.update(uuid, |task| {
            task.consecutive_failures = task.consecutive_failures.saturating_add(1);
        })
        .await
    }

    async fn update(&self, uuid: &Uuid, apply: impl FnOnce(&mut Task)) -> Result<Option<Task>> {
        let mut inner = self.inner.lock().await;
        let Some(current) = inner.by_uuid.get(uuid) else {
            return Ok(None);
        };
        let mut updated = current.clone();
        apply(&mut updated);
        write_task(&self.dir, &updated)?;
        inner.by_uuid.insert(*uuid, updated.clone());
        Ok(Some(updated))
    }
}

fn task_path(dir: &Path, uuid: &Uuid) -> PathBuf {
    dir.join(format!("{uuid}.{TASK_EXT}"))
}

fn read_task(path: &Path) -> Result<Task> {
    let data = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;
    let task: Task = serde_json::from_str(&data)
        .with_context(|| format!("invalid task file {}", path.display()))?;
    if task.credential.is_blank() {
        anyhow::bail!("task {} has an empty credential", task.uuid);
    }
    Ok(task)
}

/// Write via a temp file and rename so readers never see a partial record.
fn write_task(dir: &Path, task: &Task) -> Result<()> {
    let path = task_path(dir, &task.uuid);
    let tmp = dir.join(format!(".{}.tmp", task.uuid));
    let data = serde_json::to_vec_pretty(task).context("failed to serialize task")?;

    let mut file = std::fs::File::create(&tmp)
        .with_context(|| format!("failed to create {}", tmp.display()))?;
    file.write_all(&data)
        .and_then(|_| file.sync_all())
        .with_context(|| format!("failed to write {}", tmp.display()))?;
    drop(file);

    if let Err(e) = std::fs::rename(&tmp, &path) {
        let _ = std::fs::remove_file(&tmp);
        return Err(e)
            .with_context(|| format!("failed to move task into place at {}", path.display()));
    }
    Ok(())
}

fn remove_task_file(dir: &Path, uuid: &Uuid) -> Result<()> {
    let path = task_path(dir, uuid);
    match std::fs::remove_file(&path) {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e).with_context(|| format!("failed to delete {}", path.display())),
    }
}

pub(crate) fn now_ms() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_millis() as u64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(account_id: AccountId, created_at_ms: u64) -> Task {
        Task {
            created_at_ms,
            ..Task::new(account_id, Credential::new(format!("cred-{account_id}")), account_id)
        }
    }

    #[tokio::test]
    async fn insert_persists_and_reloads() {
        let dir = tempfile::tempdir().unwrap();
        let (store, report) = TaskStore::open(dir.path()).unwrap();
        assert!(report.displaced.is_empty());

        let t = task(42, 1_000);
        assert!(store.insert_replacing(t.clone()).await.unwrap().is_none());
        assert!(dir.path().join(format!("{}.json", t.uuid)).exists());

        let (reloaded, _) = TaskStore::open(dir.path()).unwrap();
        assert_eq!(reloaded.get(&t.uuid).await, Some(t.clone()));
        assert_eq!(reloaded.get_by_account(42).await.map(|x| x.uuid), Some(t.uuid));
    }

    #[tokio::test]
    async fn insert_replaces_same_account() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = TaskStore::open(dir.path()).unwrap();

        let first = task(7, 1_000);
        let second = task(7, 2_000);
        store.insert_replacing(first.clone()).await.unwrap();
        let displaced = store.insert_replacing(second.clone()).await.unwrap();

        assert_eq!(displaced.map(|t| t.uuid), Some(first.uuid));
        assert_eq!(store.len().await, 1);
        assert!(store.get(&first.uuid).await.is_none());
        assert!(!dir.path().join(format!("{}.json", first.uuid)).exists());
    }

    #[tokio::test]
    async fn concurrent_creates_for_one_account_leave_one_task() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = TaskStore::open(dir.path()).unwrap();
        let store = std::sync::Arc::new(store);

        let mut handles = Vec::new();
        for i in 0..8 {
            let store = store.clone();
            handles.push(tokio::spawn(async move {
                store.insert_replacing(task(99, i)).await.unwrap()
            }));
        }
        for h in handles {
            h.await.unwrap();
        }

        assert_eq!(store.len().await, 1);
        let files = std::fs::read_dir(dir.path()).unwrap().count();
        assert_eq!(files, 1);
    }

    #[tokio::test]
    async fn failure_counter_increments_and_resets() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = TaskStore::open(dir.path()).unwrap();
        let t = task(1, 1_000);
        store.insert_replacing(t.clone()).await.unwrap();

        let after = store.record_failure(&t.uuid).await.unwrap().unwrap();
        assert_eq!(after.consecutive_failures, 1);
        let after = store.record_failure(&t.uuid).await.unwrap().unwrap();
        assert_eq!(after.consecutive_failures, 2);

        let ok = store.record_success(&t.uuid, 5_000).await.unwrap().unwrap();
        assert_eq!(ok.consecutive_failures, 0);
        assert_eq!(ok.last_heartbeat_ms, Some(5_000));

        let (reloaded, _) = TaskStore::open(dir.path()).unwrap();
        assert_eq!(reloaded.get(&t.uuid).await.unwrap().last_heartbeat_ms, Some(5_000));
    }

    #[tokio::test]
    async fn update_on_missing_task_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let (store, _) = TaskStore::open(dir.path()).unwrap();
        assert!(store.record_failure(&Uuid::new_v4()).await.unwrap().is_none());
        assert!(store.remove(&Uuid::new_v4()).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn open_dedupes_by_account_keeping_newest() {
        let dir = tempfile::tempdir().unwrap();
        let old = task(5, 1_000);
        let new = task(5, 9_000);
        let other = task(6, 500);
        for t in [&old, &new, &other] {
            write_task(dir.path(), t).unwrap();
        }
        std::fs::write(dir.path().join("garbage.json"), "{not json").unwrap();
        std::fs::write(dir.path().join("notes.txt"), "ignored").unwrap();

        let (store, report) = TaskStore::open(dir.path()).unwrap();
        assert_eq!(report.errors, 1);
        assert_eq!(report.displaced.len(), 1);
        assert_eq!(report.displaced[0].uuid, old.uuid);
        assert_eq!(store.len().await, 2);
        assert_eq!(store.get_by_account(5).await.unwrap().uuid, new.uuid);
        assert!(!dir.path().join(format!("{}.json", old.uuid)).exists());
    }

    #[test]
    fn credential_is_written_in_the_record() {
        let dir = tempfile::tempdir().unwrap();
        let t = task(3, 1);
        write_task(dir.path(), &t).unwrap();
        let raw = std::fs::read_to_string(task_path(dir.path(), &t.uuid)).unwrap();
        assert!(raw.contains("\"credential\": \"cred-3\""));
        assert!(!dir.path().join(format!(".{}.tmp", t.uuid)).exists());
    }
}
