mod chapters;
mod outlines;
mod projects;
mod settings;

pub use settings::{SystemLlmDefaults, UserLlmConfig};

use sqlx::sqlite::{SqlitePool, SqlitePoolOptions};

use crate::error::Result;

/// Persistence surface of the engine: one SQLite pool, schema bootstrapped
/// on connect, operation impls split per domain file. The vector store and
/// the continuity indices share this pool through `pool()`.
#[derive(Clone)]
pub struct Database {
    pool: SqlitePool,
}

impl Database {
    pub async fn connect(database_url: &str) -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(5)
            .connect(database_url)
            .await?;
        let db = Self { pool };
        db.init_schema().await?;
        Ok(db)
    }

    /// Single-connection in-memory database for tests. A pooled in-memory
    /// SQLite gets a fresh database per connection, so the pool is pinned
    /// to one.
    pub async fn connect_in_memory() -> Result<Self> {
        let pool = SqlitePoolOptions::new()
            .max_connections(1)
            .connect("sqlite::memory:")
            .await?;
        let db = Self { pool };
        db.init_schema().await?;
        Ok(db)
    }

    pub(crate) fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    async fn init_schema(&self) -> Result<()> {
        sqlx::raw_sql(SCHEMA).execute(&self.pool).await?;
        Ok(())
    }
}

const SCHEMA: &str = r#"
CREATE TABLE IF NOT EXISTS projects (
    id TEXT PRIMARY KEY,
    user_id TEXT NOT NULL,
    title TEXT NOT NULL,
    initial_prompt TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL DEFAULT 'draft',
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS blueprints (
    project_id TEXT PRIMARY KEY,
    title TEXT NOT NULL DEFAULT '',
    genre TEXT NOT NULL DEFAULT '',
    style TEXT NOT NULL DEFAULT '',
    tone TEXT NOT NULL DEFAULT '',
    target_audience TEXT NOT NULL DEFAULT '',
    one_sentence_summary TEXT NOT NULL DEFAULT '',
    full_synopsis TEXT NOT NULL DEFAULT '',
    world_setting TEXT NOT NULL DEFAULT '{}',
    needs_part_outlines INTEGER NOT NULL DEFAULT 0,
    total_chapters INTEGER NOT NULL DEFAULT 0,
    chapters_per_part INTEGER NOT NULL DEFAULT 0,
    characters TEXT NOT NULL DEFAULT '[]',
    relationships TEXT NOT NULL DEFAULT '[]'
);

CREATE TABLE IF NOT EXISTS part_outlines (
    project_id TEXT NOT NULL,
    part_number INTEGER NOT NULL,
    title TEXT NOT NULL DEFAULT '',
    summary TEXT NOT NULL DEFAULT '',
    start_chapter INTEGER NOT NULL,
    end_chapter INTEGER NOT NULL,
    theme TEXT NOT NULL DEFAULT '',
    key_events TEXT NOT NULL DEFAULT '[]',
    conflicts TEXT NOT NULL DEFAULT '[]',
    character_arcs TEXT NOT NULL DEFAULT '{}',
    ending_hook TEXT NOT NULL DEFAULT '',
    generation_status TEXT NOT NULL DEFAULT 'pending',
    progress INTEGER NOT NULL DEFAULT 0,
    updated_at TEXT NOT NULL,
    PRIMARY KEY (project_id, part_number)
);

CREATE TABLE IF NOT EXISTS chapter_outlines (
    project_id TEXT NOT NULL,
    chapter_number INTEGER NOT NULL,
    title TEXT NOT NULL DEFAULT '',
    summary TEXT NOT NULL DEFAULT '',
    PRIMARY KEY (project_id, chapter_number)
);

CREATE TABLE IF NOT EXISTS chapters (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    chapter_number INTEGER NOT NULL,
    status TEXT NOT NULL DEFAULT 'not_generated',
    selected_version_id TEXT,
    word_count INTEGER NOT NULL DEFAULT 0,
    real_summary TEXT,
    analysis_data TEXT,
    UNIQUE (project_id, chapter_number)
);

CREATE TABLE IF NOT EXISTS chapter_versions (
    id TEXT PRIMARY KEY,
    chapter_id TEXT NOT NULL,
    version_label TEXT NOT NULL DEFAULT '',
    content TEXT NOT NULL DEFAULT '',
    provider_metadata TEXT NOT NULL DEFAULT '{}',
    created_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS chapter_evaluations (
    id TEXT PRIMARY KEY,
    chapter_id TEXT NOT NULL,
    version_id TEXT,
    decision TEXT NOT NULL,
    feedback TEXT NOT NULL DEFAULT ''
);

CREATE TABLE IF NOT EXISTS character_state_index (
    project_id TEXT NOT NULL,
    chapter_number INTEGER NOT NULL,
    character_name TEXT NOT NULL,
    location TEXT NOT NULL DEFAULT '',
    status TEXT NOT NULL DEFAULT '',
    changes TEXT NOT NULL DEFAULT '[]',
    PRIMARY KEY (project_id, chapter_number, character_name)
);

CREATE TABLE IF NOT EXISTS foreshadowing_index (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    planted_chapter INTEGER NOT NULL,
    description TEXT NOT NULL,
    original_text TEXT NOT NULL DEFAULT '',
    category TEXT NOT NULL DEFAULT '',
    priority TEXT NOT NULL DEFAULT 'medium',
    related_entities TEXT NOT NULL DEFAULT '[]',
    status TEXT NOT NULL DEFAULT 'pending',
    resolved_chapter INTEGER,
    resolution TEXT,
    remind_after_chapter INTEGER,
    created_at TEXT NOT NULL,
    updated_at TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS vector_chunks (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    chapter_number INTEGER NOT NULL,
    chunk_index INTEGER NOT NULL,
    chapter_title TEXT NOT NULL DEFAULT '',
    content TEXT NOT NULL DEFAULT '',
    embedding BLOB NOT NULL,
    metadata TEXT NOT NULL DEFAULT '{}'
);

CREATE TABLE IF NOT EXISTS vector_summaries (
    id TEXT PRIMARY KEY,
    project_id TEXT NOT NULL,
    chapter_number INTEGER NOT NULL,
    title TEXT NOT NULL DEFAULT '',
    summary TEXT NOT NULL DEFAULT '',
    embedding BLOB NOT NULL
);

CREATE TABLE IF NOT EXISTS system_settings (
    key TEXT PRIMARY KEY,
    value TEXT NOT NULL
);

CREATE TABLE IF NOT EXISTS user_llm_configs (
    user_id TEXT PRIMARY KEY,
    api_key TEXT NOT NULL DEFAULT '',
    base_url TEXT NOT NULL DEFAULT '',
    model TEXT NOT NULL DEFAULT '',
    embedding_model TEXT NOT NULL DEFAULT '',
    active INTEGER NOT NULL DEFAULT 1
);

CREATE TABLE IF NOT EXISTS usage_counters (
    user_id TEXT NOT NULL,
    day TEXT NOT NULL,
    calls INTEGER NOT NULL DEFAULT 0,
    PRIMARY KEY (user_id, day)
);

CREATE INDEX IF NOT EXISTS idx_chapters_project ON chapters (project_id, chapter_number);
CREATE INDEX IF NOT EXISTS idx_versions_chapter ON chapter_versions (chapter_id, created_at);
CREATE INDEX IF NOT EXISTS idx_vector_chunks_project ON vector_chunks (project_id, chapter_number);
CREATE INDEX IF NOT EXISTS idx_vector_summaries_project ON vector_summaries (project_id, chapter_number);
CREATE INDEX IF NOT EXISTS idx_foreshadow_project ON foreshadowing_index (project_id, status);
CREATE INDEX IF NOT EXISTS idx_char_state_project ON character_state_index (project_id, character_name, chapter_number);
"#;

pub(crate) fn parse_timestamp(raw: &str) -> chrono::DateTime<chrono::Utc> {
    chrono::DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&chrono::Utc))
        .unwrap_or_else(|_| chrono::Utc::now())
}
