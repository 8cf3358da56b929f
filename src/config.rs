use serde::{Deserialize, Serialize};

/// Engine configuration. Values come from the environment with sensible
/// defaults; per-user LLM credentials live in the database and override the
/// environment at call time (see `llm::gateway`).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Config {
    /// OpenAI-compatible chat/embeddings endpoint used when neither the user
    /// nor the admin settings supply one.
    pub llm_base_url: String,
    pub llm_api_key: String,
    pub llm_model: String,
    pub embedding_model: String,
    /// Daily call allowance for users riding on the system key.
    pub daily_quota: i64,
    /// Candidate versions generated per chapter.
    pub version_count: usize,
    /// Upper bound on concurrent LLM calls in one fan-out.
    pub max_parallel_llm: usize,
    /// Chat / summary / chapter-generation deadlines, seconds.
    pub chat_timeout_secs: u64,
    pub summary_timeout_secs: u64,
    pub chapter_timeout_secs: u64,
    /// Splitter chunk size and overlap, in characters.
    pub chunk_size: usize,
    pub chunk_overlap: usize,
    /// Token budget handed to the context compressor.
    pub context_max_tokens: usize,
    /// Chapter outlines generated per batch.
    pub outline_batch_size: usize,
    /// Novels at or above this chapter count get part outlines.
    pub part_outline_threshold: u32,
    /// A part outline stuck in `generating` longer than this is failed on load.
    pub stale_generation_minutes: i64,
    /// Vector store switch; when false every vector operation is a no-op.
    pub vector_store_enabled: bool,
}

impl Config {
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();

        let get_env_or_default = |key: &str, default: &str| -> String {
            std::env::var(key).unwrap_or_else(|_| default.to_string())
        };

        let parse_env_or_default = |key: &str, default: usize| -> usize {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        };

        let parse_i64_env_or_default = |key: &str, default: i64| -> i64 {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        };

        let parse_u64_env_or_default = |key: &str, default: u64| -> u64 {
            std::env::var(key)
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(default)
        };

        let parse_bool_env_or_default = |key: &str, default: bool| -> bool {
            std::env::var(key)
                .ok()
                .and_then(|v| v.to_lowercase().parse::<bool>().ok())
                .unwrap_or(default)
        };

        Self {
            llm_base_url: get_env_or_default("LLM_BASE_URL", "https://api.openai.com/v1"),
            llm_api_key: std::env::var("LLM_API_KEY").unwrap_or_default(),
            llm_model: get_env_or_default("LLM_MODEL", "gpt-4o"),
            embedding_model: get_env_or_default("EMBEDDING_MODEL", "text-embedding-3-small"),
            daily_quota: parse_i64_env_or_default("DAILY_QUOTA", 200),
            version_count: parse_env_or_default("VERSION_COUNT", 3),
            max_parallel_llm: parse_env_or_default("MAX_PARALLEL_LLM", 3),
            chat_timeout_secs: parse_u64_env_or_default("CHAT_TIMEOUT_SECS", 300),
            summary_timeout_secs: parse_u64_env_or_default("SUMMARY_TIMEOUT_SECS", 180),
            chapter_timeout_secs: parse_u64_env_or_default("CHAPTER_TIMEOUT_SECS", 600),
            chunk_size: parse_env_or_default("CHUNK_SIZE", 500),
            chunk_overlap: parse_env_or_default("CHUNK_OVERLAP", 50),
            context_max_tokens: parse_env_or_default("CONTEXT_MAX_TOKENS", 8000),
            outline_batch_size: parse_env_or_default("OUTLINE_BATCH_SIZE", 5),
            part_outline_threshold: parse_i64_env_or_default("PART_OUTLINE_THRESHOLD", 30) as u32,
            stale_generation_minutes: parse_i64_env_or_default("STALE_GENERATION_MINUTES", 15),
            vector_store_enabled: parse_bool_env_or_default("VECTOR_STORE_ENABLED", true),
        }
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            llm_base_url: "https://api.openai.com/v1".to_string(),
            llm_api_key: String::new(),
            llm_model: "gpt-4o".to_string(),
            embedding_model: "text-embedding-3-small".to_string(),
            daily_quota: 200,
            version_count: 3,
            max_parallel_llm: 3,
            chat_timeout_secs: 300,
            summary_timeout_secs: 180,
            chapter_timeout_secs: 600,
            chunk_size: 500,
            chunk_overlap: 50,
            context_max_tokens: 8000,
            outline_batch_size: 5,
            part_outline_threshold: 30,
            stale_generation_minutes: 15,
            vector_store_enabled: true,
        }
    }
}
