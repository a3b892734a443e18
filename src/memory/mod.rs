//! Conversation memory
//!
//! SQLite-backed store of every user/assistant turn. The autonomy engine and
//! the generation facade query it for context; both impose their own timeout
//! on the async surface, so blocking sqlite work runs on the blocking pool.

use anyhow::{Context, Result};
use chrono::Utc;
use rusqlite::{params, Connection};
use std::collections::HashSet;
use std::path::Path;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// One ranked memory lookup result
#[derive(Debug, Clone)]
pub struct MemoryHit {
    /// RFC 3339 timestamp of the stored message
    pub timestamp: String,
    /// "user" or "assistant"
    pub speaker: String,
    pub text: String,
    /// Keyword-overlap score in [0, 1]; 0 for recency-only results
    pub score: f32,
}

/// SQLite-backed conversation store
pub struct MemoryStore {
    conn: Arc<Mutex<Connection>>,
    max_messages: usize,
}

impl MemoryStore {
    /// Open (or create) the store at the given path
    pub fn open<P: AsRef<Path>>(path: P, max_messages: usize) -> Result<Self> {
        let path = path.as_ref();
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("Failed to create {}", parent.display()))?;
        }

        let conn = Connection::open(path)
            .with_context(|| format!("Failed to open memory database {}", path.display()))?;
        conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL;")?;
        Self::init_schema(&conn)?;

        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            max_messages,
        })
    }

    /// In-memory store for tests and degraded startup
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        Self::init_schema(&conn)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            max_messages: 1000,
        })
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS messages (
                id INTEGER PRIMARY KEY AUTOINCREMENT,
                speaker TEXT NOT NULL,
                text TEXT NOT NULL,
                created_at TEXT NOT NULL
            );

            CREATE INDEX IF NOT EXISTS idx_messages_created ON messages(created_at DESC);
        "#,
        )?;
        Ok(())
    }

    /// Store one conversation turn
    pub async fn store_message(&self, speaker: &str, text: &str) -> Result<()> {
        let text = text.trim();
        if text.is_empty() {
            return Ok(());
        }

        let conn = self.conn.lock().await;
        conn.execute(
            "INSERT INTO messages (speaker, text, created_at) VALUES (?1, ?2, ?3)",
            params![speaker, text, Utc::now().to_rfc3339()],
        )?;

        // Trim the tail so the store stays bounded
        conn.execute(
            "DELETE FROM messages WHERE id NOT IN
             (SELECT id FROM messages ORDER BY id DESC LIMIT ?1)",
            params![self.max_messages as i64],
        )?;
        Ok(())
    }

    /// Most recent messages, oldest first
    pub async fn recent(&self, n: usize) -> Result<Vec<MemoryHit>> {
        let conn = self.conn.lock().await;
        let mut stmt = conn.prepare(
            "SELECT speaker, text, created_at FROM messages ORDER BY id DESC LIMIT ?1",
        )?;
        let mut hits: Vec<MemoryHit> = stmt
            .query_map(params![n as i64], |row| {
                Ok(MemoryHit {
                    speaker: row.get(0)?,
                    text: row.get(1)?,
                    timestamp: row.get(2)?,
                    score: 0.0,
                })
            })?
            .collect::<std::result::Result<_, _>>()?;
        hits.reverse();
        Ok(hits)
    }

    /// Ranked keyword lookup: messages sharing the most terms with `topic`,
    /// best first, filtered by `min_score`.
    pub async fn query(&self, topic: &str, limit: usize, min_score: f32) -> Result<Vec<MemoryHit>> {
        let topic_terms = terms(topic);
        if topic_terms.is_empty() {
            return Ok(Vec::new());
        }

        // Scan a bounded window of recent messages; the store is trimmed, so
        // this stays cheap without an index over term vectors.
        let candidates = {
            let conn = self.conn.lock().await;
            let mut stmt = conn.prepare(
                "SELECT speaker, text, created_at FROM messages ORDER BY id DESC LIMIT 500",
            )?;
            let rows = stmt
                .query_map([], |row| {
                    Ok((
                        row.get::<_, String>(0)?,
                        row.get::<_, String>(1)?,
                        row.get::<_, String>(2)?,
                    ))
                })?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            rows
        };

        let mut hits: Vec<MemoryHit> = candidates
            .into_iter()
            .filter_map(|(speaker, text, timestamp)| {
                let score = overlap_score(&topic_terms, &terms(&text));
                (score > min_score && score > 0.0).then_some(MemoryHit {
                    speaker,
                    text,
                    timestamp,
                    score,
                })
            })
            .collect();

        hits.sort_by(|a, b| {
            b.score
                .partial_cmp(&a.score)
                .unwrap_or(std::cmp::Ordering::Equal)
        });
        hits.truncate(limit);
        debug!("Memory query matched {} message(s)", hits.len());
        Ok(hits)
    }

    /// Total stored messages
    pub async fn message_count(&self) -> Result<usize> {
        let conn = self.conn.lock().await;
        let count: i64 = conn.query_row("SELECT COUNT(*) FROM messages", [], |row| row.get(0))?;
        Ok(count as usize)
    }
}

/// Lowercased word set, short tokens dropped
fn terms(text: &str) -> HashSet<String> {
    text.to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .filter(|t| t.len() > 2)
        .map(|t| t.to_string())
        .collect()
}

/// Fraction of query terms present in the candidate
fn overlap_score(query: &HashSet<String>, candidate: &HashSet<String>) -> f32 {
    if query.is_empty() {
        return 0.0;
    }
    let shared = query.intersection(candidate).count();
    shared as f32 / query.len() as f32
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_store_and_recent_order() {
        let store = MemoryStore::open_in_memory().unwrap();
        store.store_message("user", "first message").await.unwrap();
        store.store_message("assistant", "second message").await.unwrap();

        let recent = store.recent(5).await.unwrap();
        assert_eq!(recent.len(), 2);
        assert_eq!(recent[0].text, "first message");
        assert_eq!(recent[1].speaker, "assistant");
    }

    #[tokio::test]
    async fn test_empty_messages_are_skipped() {
        let store = MemoryStore::open_in_memory().unwrap();
        store.store_message("user", "   ").await.unwrap();
        assert_eq!(store.message_count().await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_query_ranks_by_overlap() {
        let store = MemoryStore::open_in_memory().unwrap();
        store
            .store_message("user", "the project deadline moved to friday")
            .await
            .unwrap();
        store
            .store_message("user", "lunch was good today")
            .await
            .unwrap();
        store
            .store_message("assistant", "I set a reminder about the project")
            .await
            .unwrap();

        let hits = store.query("project deadline", 5, 0.0).await.unwrap();
        assert!(!hits.is_empty());
        assert!(hits[0].text.contains("deadline"));
        assert!(hits.iter().all(|h| h.score > 0.0));
        assert!(!hits.iter().any(|h| h.text.contains("lunch")));
    }

    #[tokio::test]
    async fn test_query_min_score_filters() {
        let store = MemoryStore::open_in_memory().unwrap();
        store
            .store_message("user", "project talk and many other words here")
            .await
            .unwrap();

        let hits = store
            .query("project deadline schedule budget", 5, 0.9)
            .await
            .unwrap();
        assert!(hits.is_empty());
    }

    #[tokio::test]
    async fn test_store_stays_bounded() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::open(dir.path().join("mem.db"), 10).unwrap();
        for i in 0..25 {
            store
                .store_message("user", &format!("message number {i}"))
                .await
                .unwrap();
        }
        assert_eq!(store.message_count().await.unwrap(), 10);

        let recent = store.recent(10).await.unwrap();
        assert_eq!(recent.last().unwrap().text, "message number 24");
    }

    #[test]
    fn test_overlap_score() {
        let q = terms("project deadline");
        let full = terms("the project deadline is near");
        let partial = terms("the project is fine");
        let none = terms("completely unrelated");
        assert!((overlap_score(&q, &full) - 1.0).abs() < 1e-6);
        assert!((overlap_score(&q, &partial) - 0.5).abs() < 1e-6);
        assert_eq!(overlap_score(&q, &none), 0.0);
    }
}
