//! SQLite-backed cache for raw model outputs.
//!
//! Keyed on everything that determines a call's output: model, prompt
//! template, rendered prompt text and token budget. Re-running an analysis on
//! the same responses replays cached outputs instead of paying again.

use async_trait::async_trait;
use fs2::FileExt;
use rusqlite::{params, Connection, OptionalExtension};
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{SystemTime, UNIX_EPOCH};

use crate::prompts::PromptInstance;

#[derive(Debug, Clone)]
pub struct CallCacheKey {
    pub model: String,
    pub template_slug: String,
    pub prompt_hash: String,
    pub max_tokens: u32,
    pub key_hash: String,
}

impl CallCacheKey {
    pub fn new(model: &str, prompt: &PromptInstance, max_tokens: u32) -> Self {
        let prompt_hash = hash_fields(&[&prompt.system, &prompt.user]);
        let max_tokens_str = max_tokens.to_string();
        let key_hash = hash_fields(&[model, &prompt.template_slug, &prompt_hash, &max_tokens_str]);

        Self {
            model: model.to_string(),
            template_slug: prompt.template_slug.clone(),
            prompt_hash,
            max_tokens,
            key_hash,
        }
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
    #[error("cache lock poisoned")]
    Poisoned,
    #[error("task join error: {0}")]
    Join(String),
}

#[async_trait]
pub trait CallCache: Send + Sync {
    async fn get(&self, key: &CallCacheKey) -> Result<Option<String>, CacheError>;
    async fn put(&self, key: &CallCacheKey, content: &str) -> Result<(), CacheError>;
}

#[derive(Clone)]
pub struct SqliteCallCache {
    path: PathBuf,
    conn: Arc<Mutex<Connection>>,
}

impl SqliteCallCache {
    pub fn new(path: impl AsRef<Path>) -> Result<Self, CacheError> {
        let path = path.as_ref().to_path_buf();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).ok();
        }
        let conn = Connection::open(&path)?;
        conn.execute_batch(
            "PRAGMA journal_mode=WAL;\
             PRAGMA synchronous=NORMAL;\
             CREATE TABLE IF NOT EXISTS model_calls (\
               key_hash TEXT PRIMARY KEY,\
               model TEXT NOT NULL,\
               template_slug TEXT NOT NULL,\
               prompt_hash TEXT NOT NULL,\
               max_tokens INTEGER NOT NULL,\
               content TEXT NOT NULL,\
               created_at INTEGER NOT NULL,\
               updated_at INTEGER NOT NULL,\
               hit_count INTEGER NOT NULL DEFAULT 0\
             );",
        )?;

        Ok(Self {
            path,
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    pub fn default_path() -> PathBuf {
        if let Ok(path) = std::env::var("TAGGER_CACHE_PATH") {
            return PathBuf::from(path);
        }
        PathBuf::from(".tagger_model_cache.sqlite")
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn lock_exclusive(&self) -> Result<CacheLock, CacheError> {
        CacheLock::new(&self.path)
    }

    fn with_conn<F, R>(&self, f: F) -> Result<R, CacheError>
    where
        F: FnOnce(&Connection) -> Result<R, CacheError>,
    {
        let guard = self.conn.lock().map_err(|_| CacheError::Poisoned)?;
        f(&guard)
    }

    /// Number of cached calls.
    pub async fn len(&self) -> Result<usize, CacheError> {
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let count: i64 =
                    conn.query_row("SELECT COUNT(*) FROM model_calls", [], |row| row.get(0))?;
                Ok(count.max(0) as usize)
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }
}

#[async_trait]
impl CallCache for SqliteCallCache {
    async fn get(&self, key: &CallCacheKey) -> Result<Option<String>, CacheError> {
        let key_hash = key.key_hash.clone();
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let content: Option<String> = conn
                    .query_row(
                        "SELECT content FROM model_calls WHERE key_hash = ?1",
                        params![key_hash],
                        |row| row.get(0),
                    )
                    .optional()?;
                if content.is_some() {
                    conn.execute(
                        "UPDATE model_calls \
                         SET hit_count = hit_count + 1, updated_at = ?1 \
                         WHERE key_hash = ?2",
                        params![now_epoch(), key_hash],
                    )?;
                }
                Ok(content)
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }

    async fn put(&self, key: &CallCacheKey, content: &str) -> Result<(), CacheError> {
        let key = key.clone();
        let content = content.to_string();
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let now = now_epoch();
                conn.execute(
                    "INSERT INTO model_calls (\
                        key_hash, model, template_slug, prompt_hash, max_tokens, content,\
                        created_at, updated_at\
                     ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8) \
                     ON CONFLICT(key_hash) DO UPDATE SET \
                        content = excluded.content, \
                        updated_at = excluded.updated_at",
                    params![
                        key.key_hash,
                        key.model,
                        key.template_slug,
                        key.prompt_hash,
                        key.max_tokens as i64,
                        content,
                        now,
                        now,
                    ],
                )?;
                Ok(())
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }
}

#[derive(Debug)]
pub struct CacheLock {
    _file: std::fs::File,
}

impl CacheLock {
    fn new(db_path: &Path) -> Result<Self, CacheError> {
        let mut lock_path = db_path.to_path_buf();
        lock_path.set_extension("lock");
        let file = std::fs::OpenOptions::new()
            .create(true)
            .truncate(false)
            .read(true)
            .write(true)
            .open(lock_path)?;
        file.lock_exclusive()?;
        Ok(Self { _file: file })
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct CachePruneStats {
    pub deleted: usize,
    pub remaining: usize,
}

impl SqliteCallCache {
    pub async fn prune(
        &self,
        max_age_days: Option<u64>,
        max_rows: Option<usize>,
    ) -> Result<CachePruneStats, CacheError> {
        let conn = self.clone();
        tokio::task::spawn_blocking(move || {
            conn.with_conn(|conn| {
                let mut deleted: usize = 0;
                if let Some(days) = max_age_days {
                    let cutoff = now_epoch().saturating_sub((days as i64).saturating_mul(86_400));
                    let removed = conn.execute(
                        "DELETE FROM model_calls WHERE updated_at < ?1",
                        params![cutoff],
                    )?;
                    deleted = deleted.saturating_add(removed);
                }

                if let Some(max_rows) = max_rows {
                    let count: i64 =
                        conn.query_row("SELECT COUNT(*) FROM model_calls", [], |row| row.get(0))?;
                    let keep = max_rows as i64;
                    if count > keep {
                        let removed = conn.execute(
                            "DELETE FROM model_calls WHERE key_hash IN (\
                                SELECT key_hash FROM model_calls \
                                ORDER BY updated_at DESC LIMIT -1 OFFSET ?1\
                             )",
                            params![keep],
                        )?;
                        deleted = deleted.saturating_add(removed);
                    }
                }

                let remaining: i64 =
                    conn.query_row("SELECT COUNT(*) FROM model_calls", [], |row| row.get(0))?;
                Ok(CachePruneStats {
                    deleted,
                    remaining: remaining.max(0) as usize,
                })
            })
        })
        .await
        .map_err(|e| CacheError::Join(e.to_string()))?
    }
}

/// blake3 hex digest of a single text.
pub fn hash_text(text: &str) -> String {
    blake3::hash(text.as_bytes()).to_hex().to_string()
}

fn hash_fields(fields: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for (idx, field) in fields.iter().enumerate() {
        if idx > 0 {
            hasher.update(b"|");
        }
        hasher.update(field.as_bytes());
    }
    hasher.finalize().to_hex().to_string()
}

fn now_epoch() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs() as i64
}
