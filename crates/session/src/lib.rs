//! LOGBOOK: Conversation transcripts
//!
//! One JSON file per conversation key. Idle conversations restart empty, and
//! only a bounded number stay cached in memory.

use chrono::{DateTime, Duration, Local};
use labrelay_config::paths::safe_filename;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::{debug, info, warn};

pub const DEFAULT_MAX_MESSAGES: usize = 100;
pub const DEFAULT_MAX_SESSIONS: usize = 100;

#[derive(Error, Debug)]
pub enum SessionError {
    #[error("◆ LOGBOOK I/O FAILURE: {0}")]
    Io(#[from] std::io::Error),

    #[error("◆ LOGBOOK ENTRY UNREADABLE: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, SessionError>;

/// One conversation
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Conversation {
    pub key: String,
    pub messages: Vec<Entry>,
    pub created_at: DateTime<Local>,
    pub updated_at: DateTime<Local>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
    #[serde(default = "default_max_messages")]
    pub max_messages: usize,
}

fn default_max_messages() -> usize {
    DEFAULT_MAX_MESSAGES
}

/// One transcript line
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entry {
    pub role: String,
    pub content: String,
    pub timestamp: DateTime<Local>,
    #[serde(flatten)]
    pub extra: HashMap<String, serde_json::Value>,
}

impl Conversation {
    pub fn new(key: impl Into<String>) -> Self {
        Self::with_max_messages(key, DEFAULT_MAX_MESSAGES)
    }

    pub fn with_max_messages(key: impl Into<String>, max_messages: usize) -> Self {
        let now = Local::now();
        Self {
            key: key.into(),
            messages: Vec::new(),
            created_at: now,
            updated_at: now,
            metadata: HashMap::new(),
            max_messages,
        }
    }

    /// No turns recorded yet
    pub fn is_fresh(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn add_message(&mut self, role: impl Into<String>, content: impl Into<String>) {
        self.messages.push(Entry {
            role: role.into(),
            content: content.into(),
            timestamp: Local::now(),
            extra: HashMap::new(),
        });
        self.updated_at = Local::now();
        self.truncate();
    }

    fn truncate(&mut self) {
        if self.messages.len() > self.max_messages {
            let excess = self.messages.len() - self.max_messages;
            self.messages.drain(0..excess);
            debug!("◆ {} TRIMMED TO {} ENTRIES", self.key, self.messages.len());
        }
    }

    /// Last `max_messages` entries as model messages
    pub fn history(&self, max_messages: usize) -> Vec<labrelay_provider::Message> {
        self.messages
            .iter()
            .skip(self.messages.len().saturating_sub(max_messages))
            .map(|entry| labrelay_provider::Message {
                role: entry.role.clone(),
                content: Some(entry.content.clone()),
                tool_calls: None,
                tool_call_id: None,
                name: None,
            })
            .collect()
    }

    /// Whether the last activity is older than `idle`
    pub fn is_idle(&self, idle: Duration, now: DateTime<Local>) -> bool {
        now.signed_duration_since(self.updated_at) > idle
    }

    /// Start over under the same key
    pub fn restart(&mut self) {
        let now = Local::now();
        self.messages.clear();
        self.metadata.clear();
        self.created_at = now;
        self.updated_at = now;
    }
}

/// Loads, caches and persists conversations
pub struct ConversationStore {
    dir: PathBuf,
    cache: HashMap<String, Conversation>,
    max_messages: usize,
    idle: Option<Duration>,
    max_sessions: usize,
}

impl ConversationStore {
    pub fn new(dir: impl AsRef<Path>) -> Self {
        let dir = dir.as_ref().to_path_buf();
        if let Err(e) = std::fs::create_dir_all(&dir) {
            warn!("◆ LOGBOOK DIR {} UNAVAILABLE: {}", dir.display(), e);
        }
        Self {
            dir,
            cache: HashMap::new(),
            max_messages: DEFAULT_MAX_MESSAGES,
            idle: None,
            max_sessions: DEFAULT_MAX_SESSIONS,
        }
    }

    pub fn with_max_messages(mut self, max_messages: usize) -> Self {
        self.max_messages = max_messages.max(1);
        self
    }

    /// Conversations idle longer than this restart empty
    pub fn with_idle_expiry(mut self, minutes: i64) -> Self {
        self.idle = (minutes > 0).then(|| Duration::minutes(minutes));
        self
    }

    pub fn with_max_sessions(mut self, max_sessions: usize) -> Self {
        self.max_sessions = max_sessions.max(1);
        self
    }

    pub fn max_messages(&self) -> usize {
        self.max_messages
    }

    pub fn cached(&self) -> usize {
        self.cache.len()
    }

    /// Cached, persisted or brand-new conversation for `key`
    pub async fn get_or_create(&mut self, key: &str) -> &mut Conversation {
        if !self.cache.contains_key(key) {
            let loaded = self.load(key).await;
            self.evict_for_insert();
            let conversation =
                loaded.unwrap_or_else(|| Conversation::with_max_messages(key, self.max_messages));
            self.cache.insert(key.to_string(), conversation);
        }

        let idle = self.idle;
        let conversation = self
            .cache
            .entry(key.to_string())
            .or_insert_with(|| Conversation::with_max_messages(key, DEFAULT_MAX_MESSAGES));
        if let Some(idle) = idle {
            if !conversation.is_fresh() && conversation.is_idle(idle, Local::now()) {
                info!("◆ {} IDLE; STARTING A NEW CONVERSATION", conversation.key);
                conversation.restart();
            }
        }
        conversation
    }

    /// Drop the least recently active conversation when the cache is full
    fn evict_for_insert(&mut self) {
        while self.cache.len() >= self.max_sessions {
            let oldest = self
                .cache
                .values()
                .min_by_key(|c| c.updated_at)
                .map(|c| c.key.clone());
            match oldest {
                Some(key) => {
                    debug!("◆ EVICTING {} FROM CACHE", key);
                    self.cache.remove(&key);
                }
                None => break,
            }
        }
    }

    pub async fn save(&self, conversation: &Conversation) -> Result<()> {
        let path = self.path_for(&conversation.key);
        let content = serde_json::to_string_pretty(conversation)?;
        tokio::fs::write(&path, content).await?;
        debug!("◆ LOGGED {}", conversation.key);
        Ok(())
    }

    /// Persist the cached copy of `key`, if any
    pub async fn save_key(&self, key: &str) -> Result<()> {
        match self.cache.get(key) {
            Some(conversation) => self.save(conversation).await,
            None => Ok(()),
        }
    }

    async fn load(&self, key: &str) -> Option<Conversation> {
        let path = self.path_for(key);
        let content = match tokio::fs::read_to_string(&path).await {
            Ok(content) => content,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return None,
            Err(e) => {
                warn!("◆ CANNOT READ {}: {}", key, e);
                return None;
            }
        };

        match serde_json::from_str::<Conversation>(&content) {
            Ok(mut conversation) => {
                if conversation.max_messages != self.max_messages {
                    conversation.max_messages = self.max_messages;
                    conversation.truncate();
                }
                Some(conversation)
            }
            Err(e) => {
                warn!("◆ CORRUPT LOGBOOK ENTRY {}: {}", key, e);
                None
            }
        }
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.dir.join(format!("{}.json", safe_filename(key)))
    }

    pub async fn delete(&mut self, key: &str) -> Result<bool> {
        self.cache.remove(key);
        let path = self.path_for(key);
        match tokio::fs::remove_file(path).await {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Keys of all persisted conversations, sorted
    pub async fn list(&self) -> Vec<String> {
        let mut keys = Vec::new();
        let Ok(mut entries) = tokio::fs::read_dir(&self.dir).await else {
            return keys;
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            if let Ok(content) = tokio::fs::read_to_string(&path).await {
                if let Ok(conversation) = serde_json::from_str::<Conversation>(&content) {
                    keys.push(conversation.key);
                }
            }
        }

        keys.sort();
        keys
    }
}
