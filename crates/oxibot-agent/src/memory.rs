//! Memory system — long-term memory and automatic consolidation.
//!
//! Port of nanobot's `agent/memory.py`.
//!
//! The agent's memory is file-based:
//! - **Long-term memory**: `workspace/memory/MEMORY.md` — distilled durable facts
//! - **History**: `workspace/memory/HISTORY.md` — append-only dated summaries,
//!   written by consolidation as the transcript is folded down
//!
//! The context builder reads `MEMORY.md` on every prompt build (passive read).
//! Consolidation is what keeps it from growing without bound — the agent
//! loop triggers it in the background when a session's transcript crosses
//! `memoryWindow`, and again (archiving everything) on `/new`.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use oxibot_core::types::Message;
use oxibot_providers::traits::{LlmProvider, LlmRequestConfig};
use tracing::{debug, info, warn};

/// Fixed system instruction for the consolidation LLM call.
const CONSOLIDATION_SYSTEM_PROMPT: &str =
    "You are a memory consolidation agent. Respond only with valid JSON.";

// ─────────────────────────────────────────────
// MemoryStore
// ─────────────────────────────────────────────

/// File-based memory store for the agent.
///
/// Manages `memory/MEMORY.md` (long-term) and `memory/HISTORY.md` (history).
pub struct MemoryStore {
    /// The `memory/` directory inside the workspace.
    memory_dir: PathBuf,
    /// Path to the long-term memory file.
    memory_file: PathBuf,
    /// Path to the history file.
    history_file: PathBuf,
}

impl MemoryStore {
    /// Create a new memory store, creating the `memory/` directory if needed.
    pub fn new(workspace: &Path) -> std::io::Result<Self> {
        let memory_dir = workspace.join("memory");
        if !memory_dir.exists() {
            std::fs::create_dir_all(&memory_dir)?;
            debug!(dir = %memory_dir.display(), "created memory directory");
        }
        Ok(Self::paths(memory_dir))
    }

    /// Create a MemoryStore without creating the directory (for read-only checks).
    pub fn new_lazy(workspace: &Path) -> Self {
        Self::paths(workspace.join("memory"))
    }

    fn paths(memory_dir: PathBuf) -> Self {
        let memory_file = memory_dir.join("MEMORY.md");
        let history_file = memory_dir.join("HISTORY.md");
        Self {
            memory_dir,
            memory_file,
            history_file,
        }
    }

    // ────────────── Long-term memory ──────────────

    /// Read the long-term memory file. Returns empty string if absent.
    pub fn read_long_term(&self) -> String {
        std::fs::read_to_string(&self.memory_file).unwrap_or_default()
    }

    /// Overwrite the entire long-term memory file.
    pub fn write_long_term(&self, content: &str) -> std::io::Result<()> {
        self.ensure_dir()?;
        std::fs::write(&self.memory_file, content)
    }

    // ────────────── History ──────────────

    /// Read the history file. Returns empty string if absent.
    pub fn read_history(&self) -> String {
        std::fs::read_to_string(&self.history_file).unwrap_or_default()
    }

    /// Append an entry (plus a trailing blank line) to the history file.
    pub fn append_history(&self, entry: &str) -> std::io::Result<()> {
        self.ensure_dir()?;
        let mut existing = std::fs::read_to_string(&self.history_file).unwrap_or_default();
        if !existing.is_empty() && !existing.ends_with('\n') {
            existing.push('\n');
        }
        existing.push_str(entry.trim_end());
        existing.push_str("\n\n");
        std::fs::write(&self.history_file, existing)
    }

    // ────────────── Context assembly ──────────────

    /// Build the memory context string for the system prompt.
    ///
    /// Returns `None` if no long-term memory exists.
    /// Format:
    /// ```text
    /// # Memory
    ///
    /// ## Long-term Memory
    /// <content of MEMORY.md>
    /// ```
    pub fn get_memory_context(&self) -> Option<String> {
        let long_term = self.read_long_term();
        if long_term.trim().is_empty() {
            return None;
        }
        Some(format!("# Memory\n\n## Long-term Memory\n\n{long_term}"))
    }

    /// Path to the memory directory.
    pub fn memory_dir(&self) -> &Path {
        &self.memory_dir
    }

    /// Path to the long-term memory file.
    pub fn memory_file(&self) -> &Path {
        &self.memory_file
    }

    /// Path to the history file.
    pub fn history_file(&self) -> &Path {
        &self.history_file
    }

    /// Ensure the memory directory exists.
    fn ensure_dir(&self) -> std::io::Result<()> {
        if !self.memory_dir.exists() {
            std::fs::create_dir_all(&self.memory_dir)?;
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────
// Consolidation
// ─────────────────────────────────────────────

/// Which slice of a transcript to fold into memory.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ConsolidationMode {
    /// Triggered by transcript length crossing `memoryWindow`: keep the most
    /// recent `floor(memoryWindow/2)` messages, consolidate everything else
    /// since the last consolidation point.
    Incremental { keep: usize },
    /// Triggered by `/new`: consolidate the whole transcript, reset the
    /// consolidation pointer to 0.
    ArchiveAll,
}

/// Response shape expected from the consolidation LLM call.
#[derive(Debug, serde::Deserialize)]
struct ConsolidationResponse {
    history_entry: String,
    memory_update: String,
}

/// Drives memory consolidation for all sessions, serializing overlapping
/// runs on the same session key so `HISTORY.md` is never double-appended.
pub struct Consolidator {
    provider: std::sync::Arc<dyn LlmProvider>,
    model: String,
    request_config: LlmRequestConfig,
    in_flight: Mutex<HashSet<String>>,
}

impl Consolidator {
    pub fn new(
        provider: std::sync::Arc<dyn LlmProvider>,
        model: String,
        request_config: LlmRequestConfig,
    ) -> Self {
        Self {
            provider,
            model,
            request_config,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    /// Try to claim the consolidation lock for a session key.
    ///
    /// Returns `false` (and logs) if another consolidation for this key is
    /// already running — the caller should return immediately rather than
    /// double-appending to history.
    fn try_claim(&self, session_key: &str) -> bool {
        let mut guard = self.in_flight.lock().unwrap();
        if guard.contains(session_key) {
            warn!(session_key, "consolidation already in flight, skipping");
            return false;
        }
        guard.insert(session_key.to_string());
        true
    }

    fn release(&self, session_key: &str) {
        self.in_flight.lock().unwrap().remove(session_key);
    }

    /// Run consolidation over `slice` for `session_key`, writing to `store`.
    ///
    /// Returns the new `lastConsolidated` index on success, or `None` if
    /// consolidation was skipped (lock contention) or failed (logged, no
    /// state change — the caller should leave `lastConsolidated` untouched).
    pub async fn consolidate(
        &self,
        session_key: &str,
        store: &MemoryStore,
        slice: &[(Message, DateTime<Utc>)],
        mode: ConsolidationMode,
        transcript_len: usize,
    ) -> Option<usize> {
        if slice.is_empty() {
            return None;
        }

        if !self.try_claim(session_key) {
            return None;
        }

        let result = self.run(store, slice).await;
        self.release(session_key);

        match result {
            Ok(()) => {
                let new_index = match mode {
                    ConsolidationMode::Incremental { keep } => transcript_len.saturating_sub(keep),
                    ConsolidationMode::ArchiveAll => 0,
                };
                info!(session_key, new_index, "memory consolidation succeeded");
                Some(new_index)
            }
            Err(e) => {
                warn!(session_key, error = %e, "memory consolidation failed, will retry later");
                None
            }
        }
    }

    async fn run(&self, store: &MemoryStore, slice: &[(Message, DateTime<Utc>)]) -> anyhow::Result<()> {
        let rendered = render_dated_lines(slice);
        let current_memory = store.read_long_term();

        let prompt = format!(
            "Summarize the following conversation slice into memory updates.\n\n\
             ## Current long-term memory\n{current_memory}\n\n\
             ## Conversation slice\n{rendered}\n\n\
             Respond with a JSON object with exactly two keys:\n\
             - \"history_entry\": one summary paragraph, prefixed with the conversation's \
             timestamp, suitable for appending to a running history log.\n\
             - \"memory_update\": the full new long-term memory content (the complete file, \
             not a diff) — fold in anything from this slice worth remembering durably, and \
             drop anything that's now stale.\n\
             Respond with nothing but the JSON object."
        );

        let messages = vec![Message::system(CONSOLIDATION_SYSTEM_PROMPT), Message::user(prompt)];

        let response = self
            .provider
            .chat(&messages, None, &self.model, &self.request_config)
            .await;

        let raw = response
            .content
            .ok_or_else(|| anyhow::anyhow!("consolidation call returned no content"))?;

        let parsed = parse_consolidation_response(&raw)
            .ok_or_else(|| anyhow::anyhow!("could not parse consolidation response as JSON"))?;

        store.append_history(&parsed.history_entry)?;
        if parsed.memory_update != current_memory {
            store.write_long_term(&parsed.memory_update)?;
        }

        Ok(())
    }
}

/// Render a transcript slice as dated lines:
/// `"[{timestamp[:16]}] {ROLE}[ [tools: ...]]: {content}"`.
fn render_dated_lines(slice: &[(Message, DateTime<Utc>)]) -> String {
    slice
        .iter()
        .map(|(msg, ts)| render_dated_line(msg, ts))
        .collect::<Vec<_>>()
        .join("\n")
}

fn render_dated_line(msg: &Message, ts: &DateTime<Utc>) -> String {
    let stamp = ts.format("%Y-%m-%dT%H:%M").to_string();
    match msg {
        Message::System { content } => format!("[{stamp}] SYSTEM: {content}"),
        Message::User { content } => format!("[{stamp}] USER: {}", content_to_text(content)),
        Message::Assistant {
            content,
            tool_calls,
            ..
        } => {
            let text = content.clone().unwrap_or_default();
            match tool_calls {
                Some(calls) if !calls.is_empty() => {
                    let names: Vec<&str> = calls.iter().map(|c| c.function.name.as_str()).collect();
                    format!(
                        "[{stamp}] ASSISTANT [tools: {}]: {text}",
                        names.join(", ")
                    )
                }
                _ => format!("[{stamp}] ASSISTANT: {text}"),
            }
        }
        Message::Tool { content, .. } => format!("[{stamp}] TOOL: {content}"),
    }
}

fn content_to_text(content: &oxibot_core::types::MessageContent) -> String {
    use oxibot_core::types::{ContentPart, MessageContent};
    match content {
        MessageContent::Text(t) => t.clone(),
        MessageContent::Parts(parts) => parts
            .iter()
            .filter_map(|p| match p {
                ContentPart::Text { text } => Some(text.clone()),
                ContentPart::ImageUrl { .. } => None,
            })
            .collect::<Vec<_>>()
            .join(" "),
    }
}

/// Parse the consolidation LLM response: strip fenced code markers, then
/// strict-then-lenient JSON parse.
fn parse_consolidation_response(raw: &str) -> Option<ConsolidationResponse> {
    let stripped = strip_code_fences(raw);
    if let Ok(v) = serde_json::from_str::<ConsolidationResponse>(&stripped) {
        return Some(v);
    }
    let repaired = crate::json_repair::parse_tool_args(&stripped);
    let history_entry = repaired.get("history_entry")?.as_str()?.to_string();
    let memory_update = repaired.get("memory_update")?.as_str()?.to_string();
    Some(ConsolidationResponse {
        history_entry,
        memory_update,
    })
}

fn strip_code_fences(raw: &str) -> String {
    let trimmed = raw.trim();
    let Some(rest) = trimmed.strip_prefix("```") else {
        return trimmed.to_string();
    };
    let rest = rest.strip_prefix("json").unwrap_or(rest);
    let rest = rest.strip_prefix('\n').unwrap_or(rest);
    rest.strip_suffix("```").unwrap_or(rest).trim().to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use oxibot_core::types::{LlmResponse, ToolDefinition};

    #[test]
    fn test_new_creates_dir() {
        let dir = tempfile::tempdir().unwrap();
        let ws = dir.path().join("workspace");
        std::fs::create_dir(&ws).unwrap();

        let store = MemoryStore::new(&ws).unwrap();
        assert!(store.memory_dir().exists());
        assert!(store.memory_dir().is_dir());
    }

    #[test]
    fn test_read_long_term_empty() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path()).unwrap();
        assert_eq!(store.read_long_term(), "");
    }

    #[test]
    fn test_write_and_read_long_term() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path()).unwrap();

        store.write_long_term("User likes Rust.").unwrap();
        assert_eq!(store.read_long_term(), "User likes Rust.");

        store.write_long_term("User prefers dark mode.").unwrap();
        assert_eq!(store.read_long_term(), "User prefers dark mode.");
    }

    #[test]
    fn test_append_history_creates_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path()).unwrap();

        store.append_history("[2026-07-28] Talked about Rust.").unwrap();
        let content = store.read_history();
        assert!(content.starts_with("[2026-07-28] Talked about Rust."));
        assert!(content.ends_with("\n\n"));
    }

    #[test]
    fn test_append_history_appends() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path()).unwrap();

        store.append_history("First entry.").unwrap();
        store.append_history("Second entry.").unwrap();

        let content = store.read_history();
        assert!(content.contains("First entry."));
        assert!(content.contains("Second entry."));
        // Entries separated by a blank line
        let idx_first = content.find("First entry.").unwrap();
        let idx_second = content.find("Second entry.").unwrap();
        assert!(idx_second > idx_first);
    }

    #[test]
    fn test_get_memory_context_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path()).unwrap();
        assert!(store.get_memory_context().is_none());
    }

    #[test]
    fn test_get_memory_context_long_term_only() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path()).unwrap();

        store.write_long_term("User prefers dark mode.").unwrap();
        let ctx = store.get_memory_context().unwrap();
        assert!(ctx.contains("# Memory"));
        assert!(ctx.contains("## Long-term Memory"));
        assert!(ctx.contains("User prefers dark mode."));
    }

    #[test]
    fn test_get_memory_context_empty_files_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path()).unwrap();

        store.write_long_term("   \n  \n  ").unwrap();
        assert!(store.get_memory_context().is_none());
    }

    #[test]
    fn test_new_lazy_no_create() {
        let dir = tempfile::tempdir().unwrap();
        let ws = dir.path().join("noexist");
        let store = MemoryStore::new_lazy(&ws);
        assert!(!store.memory_dir().exists());
        assert_eq!(store.read_long_term(), "");
        assert_eq!(store.read_history(), "");
    }

    #[test]
    fn test_render_dated_line_user() {
        let ts = "2026-07-28T10:15:30Z".parse().unwrap();
        let line = render_dated_line(&Message::user("hello there"), &ts);
        assert_eq!(line, "[2026-07-28T10:15] USER: hello there");
    }

    #[test]
    fn test_render_dated_line_assistant_with_tools() {
        use oxibot_core::types::ToolCall;
        let ts = "2026-07-28T10:15:30Z".parse().unwrap();
        let msg = Message::assistant_tool_calls(vec![ToolCall::new("1", "read_file", "{}")]);
        let line = render_dated_line(&msg, &ts);
        assert_eq!(line, "[2026-07-28T10:15] ASSISTANT [tools: read_file]: ");
    }

    #[test]
    fn test_strip_code_fences_plain() {
        assert_eq!(strip_code_fences("{\"a\":1}"), "{\"a\":1}");
    }

    #[test]
    fn test_strip_code_fences_with_json_tag() {
        let raw = "```json\n{\"a\":1}\n```";
        assert_eq!(strip_code_fences(raw), "{\"a\":1}");
    }

    #[test]
    fn test_parse_consolidation_response_strict() {
        let raw = r#"{"history_entry": "did stuff", "memory_update": "new memory"}"#;
        let parsed = parse_consolidation_response(raw).unwrap();
        assert_eq!(parsed.history_entry, "did stuff");
        assert_eq!(parsed.memory_update, "new memory");
    }

    #[test]
    fn test_parse_consolidation_response_fenced_and_trailing_comma() {
        let raw = "```json\n{\"history_entry\": \"did stuff\", \"memory_update\": \"new memory\",}\n```";
        let parsed = parse_consolidation_response(raw).unwrap();
        assert_eq!(parsed.history_entry, "did stuff");
    }

    #[test]
    fn test_parse_consolidation_response_garbage() {
        assert!(parse_consolidation_response("not json").is_none());
    }

    struct MockConsolidationProvider {
        response: String,
    }

    #[async_trait]
    impl LlmProvider for MockConsolidationProvider {
        async fn chat(
            &self,
            _messages: &[Message],
            _tools: Option<&[ToolDefinition]>,
            _model: &str,
            _config: &LlmRequestConfig,
        ) -> LlmResponse {
            LlmResponse {
                content: Some(self.response.clone()),
                ..Default::default()
            }
        }

        fn default_model(&self) -> &str {
            "mock-model"
        }

        fn display_name(&self) -> &str {
            "MockConsolidationProvider"
        }
    }

    fn sample_slice() -> Vec<(Message, DateTime<Utc>)> {
        let ts: DateTime<Utc> = "2026-07-28T10:00:00Z".parse().unwrap();
        vec![
            (Message::user("I like Rust"), ts),
            (Message::assistant("Noted!"), ts),
        ]
    }

    #[tokio::test]
    async fn test_consolidate_writes_history_and_memory() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path()).unwrap();

        let provider = std::sync::Arc::new(MockConsolidationProvider {
            response: r#"{"history_entry": "[2026-07-28] User mentioned liking Rust.", "memory_update": "User likes Rust."}"#.into(),
        });
        let consolidator = Consolidator::new(provider, "mock-model".into(), LlmRequestConfig::default());

        let new_index = consolidator
            .consolidate(
                "telegram:1",
                &store,
                &sample_slice(),
                ConsolidationMode::Incremental { keep: 0 },
                2,
            )
            .await;

        assert_eq!(new_index, Some(2));
        assert!(store.read_history().contains("liking Rust"));
        assert_eq!(store.read_long_term(), "User likes Rust.");
    }

    #[tokio::test]
    async fn test_consolidate_archive_all_resets_index() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path()).unwrap();

        let provider = std::sync::Arc::new(MockConsolidationProvider {
            response: r#"{"history_entry": "summary", "memory_update": ""}"#.into(),
        });
        let consolidator = Consolidator::new(provider, "mock-model".into(), LlmRequestConfig::default());

        let new_index = consolidator
            .consolidate("cli:direct", &store, &sample_slice(), ConsolidationMode::ArchiveAll, 6)
            .await;

        assert_eq!(new_index, Some(0));
    }

    #[tokio::test]
    async fn test_consolidate_parse_failure_returns_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path()).unwrap();

        let provider = std::sync::Arc::new(MockConsolidationProvider {
            response: "not valid json at all".into(),
        });
        let consolidator = Consolidator::new(provider, "mock-model".into(), LlmRequestConfig::default());

        let new_index = consolidator
            .consolidate(
                "telegram:2",
                &store,
                &sample_slice(),
                ConsolidationMode::Incremental { keep: 0 },
                2,
            )
            .await;

        assert_eq!(new_index, None);
        assert_eq!(store.read_history(), "");
    }

    #[tokio::test]
    async fn test_consolidate_empty_slice_noop() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path()).unwrap();

        let provider = std::sync::Arc::new(MockConsolidationProvider {
            response: "{}".into(),
        });
        let consolidator = Consolidator::new(provider, "mock-model".into(), LlmRequestConfig::default());

        let new_index = consolidator
            .consolidate("cli:direct", &store, &[], ConsolidationMode::ArchiveAll, 0)
            .await;

        assert_eq!(new_index, None);
    }

    #[tokio::test]
    async fn test_consolidate_concurrent_lock_skips_second() {
        let dir = tempfile::tempdir().unwrap();
        let store = MemoryStore::new(dir.path()).unwrap();

        let provider = std::sync::Arc::new(MockConsolidationProvider {
            response: r#"{"history_entry": "e", "memory_update": "m"}"#.into(),
        });
        let consolidator = Consolidator::new(provider, "mock-model".into(), LlmRequestConfig::default());

        assert!(consolidator.try_claim("telegram:3"));
        // Second claim on the same key must fail while the first holds it.
        assert!(!consolidator.try_claim("telegram:3"));
        consolidator.release("telegram:3");
        assert!(consolidator.try_claim("telegram:3"));
    }
}
