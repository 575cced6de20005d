#![forbid(unsafe_code)]

//! Persistent dedup store for the acquisition pipeline.
//!
//! One SQLite file per pipeline instance holds every source ever scanned,
//! every video ever seen (keyed by `(source_key, video_id)` — ids are not
//! assumed unique across sources), and the per-directory sequence counters
//! that drive ordinal filenames. The store is the single source of truth
//! for "already acquired", independent of what is physically on disk.

use std::path::Path;

use anyhow::{Context, Result, bail};
use chrono::Utc;
use libsql::{Builder, Connection, Row, params};
use tokio::sync::Mutex;

use crate::naming;

/// Lifecycle of a video record. Transitions move forward only, except the
/// explicit `failed -> queued` reset performed by `requeue_failed`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VideoStatus {
    Queued,
    Downloading,
    Success,
    Failed,
    SkippedHashtag,
    Deleted,
}

impl VideoStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            VideoStatus::Queued => "queued",
            VideoStatus::Downloading => "downloading",
            VideoStatus::Success => "success",
            VideoStatus::Failed => "failed",
            VideoStatus::SkippedHashtag => "skipped_hashtag",
            VideoStatus::Deleted => "deleted",
        }
    }

    pub fn parse(value: &str) -> Result<Self> {
        Ok(match value {
            "queued" => VideoStatus::Queued,
            "downloading" => VideoStatus::Downloading,
            "success" => VideoStatus::Success,
            "failed" => VideoStatus::Failed,
            "skipped_hashtag" => VideoStatus::SkippedHashtag,
            "deleted" => VideoStatus::Deleted,
            other => bail!("unknown video status: {other}"),
        })
    }
}

/// One durable row from the `videos` table.
#[derive(Debug, Clone)]
pub struct StoredVideo {
    pub source_key: String,
    pub video_id: String,
    pub title: String,
    pub url: String,
    pub status: VideoStatus,
    pub file_path: Option<String>,
    pub caption_path: Option<String>,
    pub created_at: String,
    pub updated_at: String,
}

fn now_iso() -> String {
    Utc::now().format("%Y-%m-%dT%H:%M:%SZ").to_string()
}

async fn configure_connection(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        PRAGMA journal_mode=WAL;
        PRAGMA synchronous=NORMAL;
        PRAGMA foreign_keys=ON;
        "#,
    )
    .await?;
    Ok(())
}

async fn ensure_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS sources (
            key TEXT PRIMARY KEY,
            display_name TEXT NOT NULL DEFAULT '',
            url TEXT NOT NULL DEFAULT '',
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS videos (
            source_key TEXT NOT NULL,
            video_id TEXT NOT NULL,
            title TEXT NOT NULL DEFAULT '',
            url TEXT NOT NULL DEFAULT '',
            status TEXT NOT NULL,
            file_path TEXT,
            caption_path TEXT,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL,
            PRIMARY KEY (source_key, video_id)
        );

        CREATE TABLE IF NOT EXISTS counters (
            dir TEXT PRIMARY KEY,
            last_index INTEGER NOT NULL DEFAULT 0,
            updated_at TEXT NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_videos_status ON videos(status);
        CREATE INDEX IF NOT EXISTS idx_videos_source ON videos(source_key);
        "#,
    )
    .await?;
    Ok(())
}

/// Wrapper around the SQLite connection. All mutations funnel through this
/// API; a single write lock serializes them so concurrent workers never
/// interleave a read-modify-write.
pub struct DedupStore {
    conn: Connection,
    write_lock: Mutex<()>,
}

impl std::fmt::Debug for DedupStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DedupStore").finish_non_exhaustive()
    }
}

impl DedupStore {
    /// Opens (and if necessary creates) the store and provisions the schema.
    pub async fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)
                .with_context(|| format!("creating store directory {}", parent.display()))?;
        }

        let db = Builder::new_local(path)
            .build()
            .await
            .with_context(|| format!("opening dedup store {}", path.display()))?;
        let conn = db.connect()?;
        configure_connection(&conn).await?;
        ensure_schema(&conn).await?;

        Ok(Self {
            conn,
            write_lock: Mutex::new(()),
        })
    }

    /// Idempotent source registration; name and URL are last-write-wins.
    pub async fn upsert_source(&self, key: &str, name: &str, url: &str) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let now = now_iso();
        self.conn
            .execute(
                r#"
                INSERT INTO sources (key, display_name, url, created_at, updated_at)
                VALUES (?1, ?2, ?3, ?4, ?4)
                ON CONFLICT(key) DO UPDATE SET
                    display_name = excluded.display_name,
                    url = excluded.url,
                    updated_at = excluded.updated_at
                "#,
                params![key, name, url, now],
            )
            .await?;
        Ok(())
    }

    /// True once any record exists for the pair, regardless of status.
    /// "Known" is deliberately a superset of "downloaded": re-queuing a
    /// failed item goes through `requeue_failed`, not through a re-scan.
    pub async fn is_known(&self, source_key: &str, video_id: &str) -> Result<bool> {
        let mut rows = self
            .conn
            .query(
                "SELECT 1 FROM videos WHERE source_key = ?1 AND video_id = ?2",
                params![source_key, video_id],
            )
            .await?;
        Ok(rows.next().await?.is_some())
    }

    /// Upserts a video record. Optional paths merge with "keep existing when
    /// the new value is null" so a later status update can never erase a
    /// path recorded by an earlier one.
    #[allow(clippy::too_many_arguments)]
    pub async fn record_status(
        &self,
        source_key: &str,
        video_id: &str,
        title: &str,
        url: &str,
        status: VideoStatus,
        file_path: Option<&str>,
        caption_path: Option<&str>,
    ) -> Result<()> {
        let _guard = self.write_lock.lock().await;
        let now = now_iso();
        self.conn
            .execute(
                r#"
                INSERT INTO videos (
                    source_key, video_id, title, url, status,
                    file_path, caption_path, created_at, updated_at
                ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?8)
                ON CONFLICT(source_key, video_id) DO UPDATE SET
                    title = excluded.title,
                    url = excluded.url,
                    status = excluded.status,
                    file_path = COALESCE(excluded.file_path, videos.file_path),
                    caption_path = COALESCE(excluded.caption_path, videos.caption_path),
                    updated_at = excluded.updated_at
                "#,
                params![
                    source_key,
                    video_id,
                    title,
                    url,
                    status.as_str(),
                    file_path,
                    caption_path,
                    now,
                ],
            )
            .await?;
        Ok(())
    }

    pub async fn get(&self, source_key: &str, video_id: &str) -> Result<Option<StoredVideo>> {
        let mut rows = self
            .conn
            .query(
                r#"
                SELECT source_key, video_id, title, url, status,
                       file_path, caption_path, created_at, updated_at
                FROM videos
                WHERE source_key = ?1 AND video_id = ?2
                "#,
                params![source_key, video_id],
            )
            .await?;
        match rows.next().await? {
            Some(row) => Ok(Some(row_to_video(&row)?)),
            None => Ok(None),
        }
    }

    /// Records in a given status, optionally scoped to one source, ordered
    /// by insertion so sweeps are deterministic.
    pub async fn list_by_status(
        &self,
        status: VideoStatus,
        source_key: Option<&str>,
    ) -> Result<Vec<StoredVideo>> {
        let sql = r#"
            SELECT source_key, video_id, title, url, status,
                   file_path, caption_path, created_at, updated_at
            FROM videos
            WHERE status = ?1 AND (?2 IS NULL OR source_key = ?2)
            ORDER BY rowid ASC
            "#;
        let mut rows = self
            .conn
            .query(sql, params![status.as_str(), source_key])
            .await?;
        let mut records = Vec::new();
        while let Some(row) = rows.next().await? {
            records.push(row_to_video(&row)?);
        }
        Ok(records)
    }

    /// Explicit `failed -> queued` reset for one source. Returns how many
    /// rows were reset.
    pub async fn requeue_failed(&self, source_key: &str) -> Result<u64> {
        let _guard = self.write_lock.lock().await;
        let now = now_iso();
        let affected = self
            .conn
            .execute(
                r#"
                UPDATE videos SET status = 'queued', updated_at = ?2
                WHERE source_key = ?1 AND status = 'failed'
                "#,
                params![source_key, now],
            )
            .await?;
        Ok(affected)
    }

    /// Atomically reserves `count` consecutive ordinals for a directory.
    ///
    /// The base is `max(stored_counter, filesystem_probe)` so a store that
    /// was reset or lost still numbers above the files surviving on disk.
    /// Reserved indices are never reused, even when the downloads they were
    /// reserved for later fail; the resulting gaps are permanent.
    pub async fn reserve_sequence(&self, dir: &Path, count: u64) -> Result<Vec<u64>> {
        if count == 0 {
            return Ok(Vec::new());
        }
        let dir_key = dir.to_string_lossy().into_owned();
        let probe = naming::highest_existing_index(dir);

        let _guard = self.write_lock.lock().await;
        let tx = self.conn.transaction().await?;
        let mut rows = tx
            .query(
                "SELECT last_index FROM counters WHERE dir = ?1",
                params![dir_key.as_str()],
            )
            .await?;
        let stored: u64 = match rows.next().await? {
            Some(row) => row.get::<i64>(0)?.max(0) as u64,
            None => 0,
        };
        let base = stored.max(probe);
        let end = base + count;
        let now = now_iso();
        tx.execute(
            r#"
            INSERT INTO counters (dir, last_index, updated_at)
            VALUES (?1, ?2, ?3)
            ON CONFLICT(dir) DO UPDATE SET
                last_index = excluded.last_index,
                updated_at = excluded.updated_at
            "#,
            params![dir_key.as_str(), end as i64, now],
        )
        .await?;
        tx.commit().await?;

        Ok(((base + 1)..=end).collect())
    }
}

fn row_to_video(row: &Row) -> Result<StoredVideo> {
    let status_text: String = row.get(4)?;
    Ok(StoredVideo {
        source_key: row.get(0)?,
        video_id: row.get(1)?,
        title: row.get(2)?,
        url: row.get(3)?,
        status: VideoStatus::parse(&status_text)?,
        file_path: row.get(5)?,
        caption_path: row.get(6)?,
        created_at: row.get(7)?,
        updated_at: row.get(8)?,
    })
}
