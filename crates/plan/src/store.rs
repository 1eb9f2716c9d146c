//! Plan store: one JSON object of id → plan, shared between processes
//!
//! Every mutation takes the in-process mutex and an exclusive lock file,
//! reloads the book from disk, applies the change and writes it back through
//! a temporary file and a rename.

use std::collections::BTreeMap;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant, SystemTime};

use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, warn};

use crate::error::{PlanError, Result};
use crate::model::Plan;

/// Plan id arguments that mean "the most recent plan"
const PLACEHOLDERS: &[&str] = &["latest", "current", "default", "null", "none", "last"];

/// A lock file with no readable holder pid older than this is considered abandoned
const STALE_LOCK_AGE: Duration = Duration::from_secs(600);

const LOCK_POLL: Duration = Duration::from_millis(25);

pub fn is_placeholder(id: Option<&str>) -> bool {
    match id.map(str::trim) {
        None | Some("") => true,
        Some(id) => PLACEHOLDERS.contains(&id.to_ascii_lowercase().as_str()),
    }
}

/// Every plan the store knows about
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PlanBook {
    plans: BTreeMap<String, Plan>,
}

impl PlanBook {
    pub fn get(&self, id: &str) -> Option<&Plan> {
        self.plans.get(id)
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut Plan> {
        self.plans.get_mut(id)
    }

    pub fn insert(&mut self, plan: Plan) {
        self.plans.insert(plan.id.clone(), plan);
    }

    pub fn contains(&self, id: &str) -> bool {
        self.plans.contains_key(id)
    }

    pub fn len(&self) -> usize {
        self.plans.len()
    }

    pub fn is_empty(&self) -> bool {
        self.plans.is_empty()
    }

    /// Most recently created plan
    pub fn latest(&self) -> Option<&Plan> {
        self.plans.values().max_by_key(|p| p.sequence)
    }

    pub fn next_sequence(&self) -> u64 {
        self.plans.values().map(|p| p.sequence).max().map_or(1, |s| s + 1)
    }

    /// Plans in creation order
    pub fn list(&self) -> Vec<&Plan> {
        let mut plans: Vec<&Plan> = self.plans.values().collect();
        plans.sort_by_key(|p| p.sequence);
        plans
    }

    /// Concrete id for a requested one, falling back to the latest plan
    pub fn resolve_id(&self, requested: Option<&str>) -> Result<String> {
        if is_placeholder(requested) {
            return self
                .latest()
                .map(|p| p.id.clone())
                .ok_or_else(|| PlanError::NotFound {
                    requested: requested.unwrap_or("latest").to_string(),
                    available: Vec::new(),
                });
        }

        let requested = requested.map(str::trim).unwrap_or_default();
        if self.plans.contains_key(requested) {
            return Ok(requested.to_string());
        }
        Err(PlanError::NotFound {
            requested: requested.to_string(),
            available: self.list().iter().map(|p| p.id.clone()).collect(),
        })
    }
}

/// Exclusive access to the book; written back by `commit`
pub struct LockedBook {
    pub book: PlanBook,
    path: PathBuf,
    _lock: LockFile,
    _local: OwnedMutexGuard<()>,
}

impl LockedBook {
    pub async fn commit(self) -> Result<()> {
        write_atomic(&self.path, &self.book).await
    }
}

struct LockFile {
    path: PathBuf,
}

impl Drop for LockFile {
    fn drop(&mut self) {
        if let Err(e) = std::fs::remove_file(&self.path) {
            if e.kind() != ErrorKind::NotFound {
                warn!("◆ CANNOT RELEASE PLAN LOCK {}: {}", self.path.display(), e);
            }
        }
    }
}

pub struct PlanStore {
    path: PathBuf,
    lock_timeout: Duration,
    local: Arc<Mutex<()>>,
}

impl PlanStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            lock_timeout: Duration::from_secs(5),
            local: Arc::new(Mutex::new(())),
        }
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout = timeout;
        self
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Read-only snapshot
    pub async fn load(&self) -> Result<PlanBook> {
        read_book(&self.path).await
    }

    /// Freshly reloaded book held under both locks until committed or dropped
    pub async fn lock(&self) -> Result<LockedBook> {
        let local = self.local.clone().lock_owned().await;
        let lock = self.acquire_file_lock().await?;
        let book = read_book(&self.path).await?;
        Ok(LockedBook {
            book,
            path: self.path.clone(),
            _lock: lock,
            _local: local,
        })
    }

    /// Reload, mutate and write back; nothing is written when `f` fails
    pub async fn update<T, F>(&self, f: F) -> Result<T>
    where
        F: FnOnce(&mut PlanBook) -> Result<T>,
    {
        let mut locked = self.lock().await?;
        let value = f(&mut locked.book)?;
        locked.commit().await?;
        Ok(value)
    }

    fn lock_path(&self) -> PathBuf {
        let mut name = self.path.as_os_str().to_os_string();
        name.push(".lock");
        PathBuf::from(name)
    }

    async fn acquire_file_lock(&self) -> Result<LockFile> {
        if let Some(parent) = self.path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        let lock_path = self.lock_path();
        let deadline = Instant::now() + self.lock_timeout;

        loop {
            let attempt = tokio::fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&lock_path)
                .await;
            match attempt {
                Ok(mut file) => {
                    use tokio::io::AsyncWriteExt;
                    file.write_all(std::process::id().to_string().as_bytes())
                        .await?;
                    debug!("◆ PLAN LOCK TAKEN: {}", lock_path.display());
                    return Ok(LockFile { path: lock_path });
                }
                Err(e) if e.kind() == ErrorKind::AlreadyExists => {
                    if is_stale(&lock_path).await {
                        warn!("◆ BREAKING ABANDONED PLAN LOCK {}", lock_path.display());
                        let _ = tokio::fs::remove_file(&lock_path).await;
                        continue;
                    }
                    if Instant::now() >= deadline {
                        return Err(PlanError::Lock(format!(
                            "{} held for more than {:?}",
                            lock_path.display(),
                            self.lock_timeout
                        )));
                    }
                    tokio::time::sleep(LOCK_POLL).await;
                }
                Err(e) => return Err(e.into()),
            }
        }
    }
}

/// Holder process gone; lock age decides only when the holder cannot be identified
async fn is_stale(lock_path: &Path) -> bool {
    let Ok(metadata) = tokio::fs::metadata(lock_path).await else {
        return false;
    };

    #[cfg(target_os = "linux")]
    {
        if let Ok(content) = tokio::fs::read_to_string(lock_path).await {
            if let Ok(pid) = content.trim().parse::<u32>() {
                return !Path::new(&format!("/proc/{}", pid)).exists();
            }
        }
    }

    metadata
        .modified()
        .ok()
        .and_then(|m| SystemTime::now().duration_since(m).ok())
        .map(|age| age > STALE_LOCK_AGE)
        .unwrap_or(false)
}

async fn read_book(path: &Path) -> Result<PlanBook> {
    match tokio::fs::read_to_string(path).await {
        Ok(content) if content.trim().is_empty() => Ok(PlanBook::default()),
        Ok(content) => Ok(serde_json::from_str(&content)?),
        Err(e) if e.kind() == ErrorKind::NotFound => Ok(PlanBook::default()),
        Err(e) => Err(e.into()),
    }
}

async fn write_atomic(path: &Path, book: &PlanBook) -> Result<()> {
    let content = serde_json::to_string_pretty(book)?;
    let mut tmp = path.as_os_str().to_os_string();
    tmp.push(format!(".{}.tmp", std::process::id()));
    let tmp = PathBuf::from(tmp);

    tokio::fs::write(&tmp, content).await?;
    if let Err(e) = tokio::fs::rename(&tmp, path).await {
        let _ = tokio::fs::remove_file(&tmp).await;
        return Err(e.into());
    }
    debug!("◆ PLAN BOOK WRITTEN: {} plans", book.len());
    Ok(())
}
