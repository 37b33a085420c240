//! Persistent conversation sessions
//!
//! Layout under `<root>/sessions/`:
//!
//! ```text
//! <id>.jsonl       one JSON turn per line, append-only
//! <id>.meta.json   title, model, timestamps, turn_count, committed_bytes
//! <id>.lock        fs2 advisory lock for writers
//! ```
//!
//! The meta file is the commit record. `append_turns` writes the new lines,
//! fsyncs, then replaces the meta file through a temp file and an atomic
//! rename. Bytes past `committed_bytes` belong to an interrupted append and
//! are ignored on load and truncated by the next writer.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{StoreError, ToolErrorKind};
use crate::metrics::SESSION_OPS;
use crate::tools::{ToolCallRequest, ToolResult};

/// Who produced a turn
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Assistant,
    Tool,
}

impl Role {
    pub fn as_str(&self) -> &'static str {
        match self {
            Role::User => "user",
            Role::Assistant => "assistant",
            Role::Tool => "tool",
        }
    }

    fn heading(&self) -> &'static str {
        match self {
            Role::User => "User",
            Role::Assistant => "Assistant",
            Role::Tool => "Tool",
        }
    }
}

/// One persisted transcript record
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Turn {
    pub role: Role,
    #[serde(default)]
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
    /// Calls requested by an assistant turn
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tool_calls: Vec<ToolCallRequest>,
    /// Failure category of a tool turn
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<ToolErrorKind>,
    pub timestamp: DateTime<Utc>,
}

impl Turn {
    fn with_role(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
            tool_name: None,
            tool_call_id: None,
            tool_calls: Vec::new(),
            error: None,
            timestamp: Utc::now(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self::with_role(Role::User, content)
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self::with_role(Role::Assistant, content)
    }

    pub fn assistant_tool_calls(content: impl Into<String>, calls: Vec<ToolCallRequest>) -> Self {
        Self {
            tool_calls: calls,
            ..Self::with_role(Role::Assistant, content)
        }
    }

    pub fn tool(result: &ToolResult) -> Self {
        Self {
            tool_name: Some(result.tool_name.clone()),
            tool_call_id: Some(result.call_id.clone()),
            error: result.error,
            ..Self::with_role(Role::Tool, result.output.clone())
        }
    }
}

/// Metadata record; also the commit record of the transcript
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SessionMeta {
    pub id: String,
    pub title: String,
    pub model: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub turn_count: usize,
    /// Length of the transcript prefix that belongs to committed appends
    #[serde(default)]
    pub committed_bytes: u64,
}

/// A loaded session: metadata plus its committed turns
#[derive(Debug, Clone, PartialEq)]
pub struct Session {
    pub id: String,
    pub title: String,
    pub model: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub turns: Vec<Turn>,
}

impl Session {
    fn from_meta(meta: SessionMeta, turns: Vec<Turn>) -> Self {
        Self {
            id: meta.id,
            title: meta.title,
            model: meta.model,
            created_at: meta.created_at,
            updated_at: meta.updated_at,
            turns,
        }
    }
}

struct SessionPaths {
    data: PathBuf,
    meta: PathBuf,
    lock: PathBuf,
}

/// Holds an exclusive lock on `<id>.lock` until dropped
struct WriteLock {
    file: File,
}

impl Drop for WriteLock {
    fn drop(&mut self) {
        let _ = self.file.unlock();
    }
}

/// Session storage manager
pub struct SessionStore {
    /// `<root>/sessions`
    dir: PathBuf,
}

impl SessionStore {
    /// Open (creating if needed) the store under `root`
    pub fn open(root: impl AsRef<Path>) -> Result<Self, StoreError> {
        let dir = root.as_ref().join("sessions");
        fs::create_dir_all(&dir)
            .map_err(|e| StoreError::io(format!("creating {}", dir.display()), e))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn paths(&self, id: &str) -> Result<SessionPaths, StoreError> {
        validate_id(id)?;
        Ok(SessionPaths {
            data: self.dir.join(format!("{}.jsonl", id)),
            meta: self.dir.join(format!("{}.meta.json", id)),
            lock: self.dir.join(format!("{}.lock", id)),
        })
    }

    fn lock(&self, paths: &SessionPaths) -> Result<WriteLock, StoreError> {
        let file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&paths.lock)
            .map_err(|e| StoreError::io("opening session lock", e))?;
        file.lock_exclusive()
            .map_err(|e| StoreError::io("locking session", e))?;
        Ok(WriteLock { file })
    }

    pub fn exists(&self, id: &str) -> bool {
        self.paths(id).map(|p| p.meta.is_file()).unwrap_or(false)
    }

    /// Create an empty session and return its id
    pub fn create(&self, title: Option<&str>, model: &str) -> Result<String, StoreError> {
        let id = uuid::Uuid::now_v7().simple().to_string();
        let paths = self.paths(&id)?;
        let _lock = self.lock(&paths)?;

        let now = Utc::now();
        let title = title
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| format!("session-{}", &id[id.len() - 8..]));
        let meta = SessionMeta {
            id: id.clone(),
            title,
            model: model.to_string(),
            created_at: now,
            updated_at: now,
            turn_count: 0,
            committed_bytes: 0,
        };

        File::create(&paths.data)
            .map_err(|e| StoreError::io("creating transcript", e))?;
        write_meta(&self.dir, &paths.meta, &meta)?;
        record("create", true);
        debug!(session = %id, "session created");
        Ok(id)
    }

    /// All sessions, most recently updated first
    pub fn list(&self) -> Result<Vec<SessionMeta>, StoreError> {
        let entries = fs::read_dir(&self.dir)
            .map_err(|e| StoreError::io(format!("listing {}", self.dir.display()), e))?;

        let mut sessions = Vec::new();
        for entry in entries.flatten() {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.ends_with(".meta.json") {
                continue;
            }
            match read_meta(&entry.path()) {
                Ok(meta) => sessions.push(meta),
                Err(e) => warn!(file = %name, error = %e, "skipping unreadable session metadata"),
            }
        }
        sessions.sort_by(|a, b| b.updated_at.cmp(&a.updated_at).then_with(|| b.id.cmp(&a.id)));
        Ok(sessions)
    }

    pub fn meta(&self, id: &str) -> Result<SessionMeta, StoreError> {
        let paths = self.paths(id)?;
        read_meta(&paths.meta)
    }

    /// Load the committed turns of a session
    pub fn load(&self, id: &str) -> Result<Session, StoreError> {
        let paths = self.paths(id)?;
        let meta = read_meta(&paths.meta)?;

        let mut raw = Vec::new();
        match File::open(&paths.data) {
            Ok(file) => {
                file.take(meta.committed_bytes)
                    .read_to_end(&mut raw)
                    .map_err(|e| StoreError::io("reading transcript", e))?;
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => {}
            Err(e) => return Err(StoreError::io("opening transcript", e)),
        }

        let turns = parse_turns(id, &raw);
        record("load", true);
        Ok(Session::from_meta(meta, turns))
    }

    /// Append turns as one atomic commit
    ///
    /// On return the meta record (including `updated_at`) describes exactly
    /// the transcript that `load` will see.
    pub fn append_turns(&self, id: &str, turns: &[Turn]) -> Result<SessionMeta, StoreError> {
        let paths = self.paths(id)?;
        let _lock = self.lock(&paths)?;
        let meta = read_meta(&paths.meta)?;
        if turns.is_empty() {
            return Ok(meta);
        }

        let result = self.append_locked(&paths, &meta, turns);
        record("append", result.is_ok());
        result
    }

    fn append_locked(&self, paths: &SessionPaths, meta: &SessionMeta, turns: &[Turn]) -> Result<SessionMeta, StoreError> {
        let mut buf = Vec::new();
        for turn in turns {
            serde_json::to_writer(&mut buf, turn)
                .map_err(|e| StoreError::Corrupt(format!("serializing turn: {}", e)))?;
            buf.push(b'\n');
        }

        let mut data = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false)
            .open(&paths.data)
            .map_err(|e| StoreError::io("opening transcript", e))?;

        let len = data
            .metadata()
            .map_err(|e| StoreError::io("reading transcript size", e))?
            .len();
        if len < meta.committed_bytes {
            return Err(StoreError::Corrupt(format!(
                "transcript {} is shorter than its committed length ({} < {})",
                meta.id, len, meta.committed_bytes
            )));
        }
        if len > meta.committed_bytes {
            warn!(session = %meta.id, stale_bytes = len - meta.committed_bytes, "dropping uncommitted transcript tail");
            data.set_len(meta.committed_bytes)
                .map_err(|e| StoreError::io("truncating transcript", e))?;
        }

        data.seek(SeekFrom::Start(meta.committed_bytes))
            .and_then(|_| data.write_all(&buf))
            .and_then(|_| data.sync_all())
            .map_err(|e| StoreError::io("appending to transcript", e))?;

        let mut next = meta.clone();
        next.updated_at = Utc::now().max(meta.updated_at);
        next.turn_count += turns.len();
        next.committed_bytes += buf.len() as u64;

        if let Err(e) = write_meta(&self.dir, &paths.meta, &next) {
            if let Err(rollback) = data.set_len(meta.committed_bytes).and_then(|_| data.sync_all()) {
                warn!(session = %meta.id, error = %rollback, "transcript rollback failed; tail stays uncommitted");
            }
            return Err(e);
        }

        debug!(session = %meta.id, appended = turns.len(), total = next.turn_count, "turns committed");
        Ok(next)
    }

    pub fn rename(&self, id: &str, title: &str) -> Result<SessionMeta, StoreError> {
        let paths = self.paths(id)?;
        let _lock = self.lock(&paths)?;
        let mut meta = read_meta(&paths.meta)?;
        meta.title = title.trim().to_string();
        meta.updated_at = Utc::now().max(meta.updated_at);
        let result = write_meta(&self.dir, &paths.meta, &meta).map(|_| meta);
        record("rename", result.is_ok());
        result
    }

    /// Remove the transcript, metadata and lock files
    pub fn delete(&self, id: &str) -> Result<(), StoreError> {
        let paths = self.paths(id)?;
        {
            let _lock = self.lock(&paths)?;
            if !paths.meta.is_file() {
                let _ = fs::remove_file(&paths.lock);
                return Err(StoreError::NotFound(id.to_string()));
            }
            fs::remove_file(&paths.meta).map_err(|e| StoreError::io("removing session metadata", e))?;
            match fs::remove_file(&paths.data) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(StoreError::io("removing transcript", e)),
            }
        }
        let _ = fs::remove_file(&paths.lock);
        record("delete", true);
        debug!(session = %id, "session deleted");
        Ok(())
    }

    /// Render a session as markdown
    pub fn export_markdown(&self, id: &str) -> Result<String, StoreError> {
        let session = self.load(id)?;
        Ok(render_markdown(&session))
    }
}

fn validate_id(id: &str) -> Result<(), StoreError> {
    let valid = !id.is_empty()
        && id.len() <= 128
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_');
    if valid {
        Ok(())
    } else {
        Err(StoreError::InvalidId(id.to_string()))
    }
}

fn read_meta(path: &Path) -> Result<SessionMeta, StoreError> {
    let text = match fs::read_to_string(path) {
        Ok(text) => text,
        Err(e) if e.kind() == io::ErrorKind::NotFound => {
            let id = path
                .file_name()
                .map(|n| n.to_string_lossy().trim_end_matches(".meta.json").to_string())
                .unwrap_or_default();
            return Err(StoreError::NotFound(id));
        }
        Err(e) => return Err(StoreError::io("reading session metadata", e)),
    };
    serde_json::from_str(&text)
        .map_err(|e| StoreError::Corrupt(format!("{}: {}", path.display(), e)))
}

/// Write the meta file via temp file + fsync + rename
fn write_meta(dir: &Path, path: &Path, meta: &SessionMeta) -> Result<(), StoreError> {
    let json = serde_json::to_vec_pretty(meta)
        .map_err(|e| StoreError::Corrupt(format!("serializing metadata: {}", e)))?;

    let mut tmp = tempfile::Builder::new()
        .prefix(".meta-")
        .suffix(".tmp")
        .tempfile_in(dir)
        .map_err(|e| StoreError::io("creating metadata temp file", e))?;
    tmp.write_all(&json)
        .and_then(|_| tmp.as_file().sync_all())
        .map_err(|e| StoreError::io("writing metadata", e))?;
    tmp.persist(path)
        .map_err(|e| StoreError::io("committing metadata", e.error))?;
    Ok(())
}

/// Parse newline-terminated records; an unterminated or unparseable
/// trailing record is an interrupted write and is skipped
fn parse_turns(id: &str, raw: &[u8]) -> Vec<Turn> {
    let mut turns = Vec::new();
    let mut rest = raw;
    while !rest.is_empty() {
        let Some(end) = rest.iter().position(|&b| b == b'\n') else {
            warn!(session = %id, bytes = rest.len(), "ignoring unterminated trailing record");
            break;
        };
        let line = &rest[..end];
        rest = &rest[end + 1..];
        if line.iter().all(u8::is_ascii_whitespace) {
            continue;
        }
        match serde_json::from_slice::<Turn>(line) {
            Ok(turn) => turns.push(turn),
            Err(e) => warn!(session = %id, error = %e, "skipping unreadable transcript record"),
        }
    }
    turns
}

fn render_markdown(session: &Session) -> String {
    let mut out = format!("# {} ({})\n\n", session.title, session.id);
    out.push_str(&format!(
        "Model: {}. Created {}, updated {}.\n",
        session.model,
        session.created_at.to_rfc3339(),
        session.updated_at.to_rfc3339()
    ));

    for turn in &session.turns {
        match (&turn.role, &turn.tool_name) {
            (Role::Tool, Some(name)) => out.push_str(&format!("\n## Tool ({})\n\n", name)),
            (role, _) => out.push_str(&format!("\n## {}\n\n", role.heading())),
        }
        if let Some(kind) = turn.error {
            out.push_str(&format!("**Error:** `{}`\n\n", kind));
        }
        if !turn.content.is_empty() {
            out.push_str(turn.content.trim_end());
            out.push('\n');
        }
        if !turn.tool_calls.is_empty() {
            let calls = serde_json::to_string_pretty(&turn.tool_calls).unwrap_or_else(|_| "[]".to_string());
            out.push_str("\n<details><summary>Tool calls</summary>\n\n```json\n");
            out.push_str(&calls);
            out.push_str("\n```\n\n</details>\n");
        }
    }
    out
}

fn record(op: &str, ok: bool) {
    SESSION_OPS
        .with_label_values(&[op, if ok { "ok" } else { "error" }])
        .inc();
}

/// Truncate to `max_chars` characters, adding an ellipsis if cut
pub fn truncate(s: &str, max_chars: usize) -> String {
    if s.chars().count() <= max_chars {
        s.to_string()
    } else {
        let kept: String = s.chars().take(max_chars.saturating_sub(3)).collect();
        format!("{}...", kept)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn store() -> (tempfile::TempDir, SessionStore) {
        let dir = tempfile::tempdir().unwrap();
        let store = SessionStore::open(dir.path()).unwrap();
        (dir, store)
    }

    #[test]
    fn test_session_creation() {
        let (_dir, store) = store();
        let id = store.create(None, "qwen3").unwrap();
        assert_eq!(id.len(), 32);
        let session = store.load(&id).unwrap();
        assert!(session.title.starts_with("session-"));
        assert_eq!(session.model, "qwen3");
        assert!(session.turns.is_empty());
        assert_eq!(session.created_at, session.updated_at);
    }

    #[test]
    fn test_turn_serialization_skips_empty_fields() {
        let line = serde_json::to_value(Turn::user("hi")).unwrap();
        assert_eq!(line["role"], "user");
        assert!(line.get("tool_calls").is_none());
        assert!(line.get("error").is_none());

        let call = ToolCallRequest::new("duck_search", json!({"query": "x"}), "call_1");
        let line = serde_json::to_value(Turn::assistant_tool_calls("", vec![call])).unwrap();
        assert_eq!(line["tool_calls"][0]["tool_name"], "duck_search");
    }

    #[test]
    fn test_invalid_ids_rejected() {
        let (_dir, store) = store();
        for id in ["", "../x", "a/b", "a.b", "with space"] {
            assert!(matches!(store.load(id), Err(StoreError::InvalidId(_))), "{:?}", id);
        }
        assert!(!store.exists("../etc"));
    }

    #[test]
    fn test_stale_tail_truncated_on_append() {
        let (_dir, store) = store();
        let id = store.create(Some("t"), "m").unwrap();
        store.append_turns(&id, &[Turn::user("one")]).unwrap();

        let data = store.dir().join(format!("{}.jsonl", id));
        let mut file = OpenOptions::new().append(true).open(&data).unwrap();
        file.write_all(b"{\"role\":\"assistant\",\"content\":\"half").unwrap();
        drop(file);

        let meta = store.append_turns(&id, &[Turn::assistant("two")]).unwrap();
        assert_eq!(meta.turn_count, 2);
        assert_eq!(fs::metadata(&data).unwrap().len(), meta.committed_bytes);
        let turns = store.load(&id).unwrap().turns;
        assert_eq!(turns.len(), 2);
        assert_eq!(turns[1].content, "two");
    }

    #[test]
    fn test_markdown_export() {
        let (_dir, store) = store();
        let id = store.create(Some("Research"), "m").unwrap();
        let call = ToolCallRequest::new("duck_search", json!({"query": "rust"}), "call_1");
        let result = ToolResult {
            call_id: "call_1".into(),
            tool_name: "duck_search".into(),
            output: "ERROR [timeout]: slow".into(),
            error: Some(ToolErrorKind::Timeout),
        };
        store
            .append_turns(
                &id,
                &[
                    Turn::user("find rust"),
                    Turn::assistant_tool_calls("", vec![call]),
                    Turn::tool(&result),
                    Turn::assistant("done"),
                ],
            )
            .unwrap();

        let md = store.export_markdown(&id).unwrap();
        assert!(md.starts_with(&format!("# Research ({})", id)));
        assert!(md.contains("## User\n\nfind rust"));
        assert!(md.contains("<details><summary>Tool calls</summary>"));
        assert!(md.contains("\"query\": \"rust\""));
        assert!(md.contains("## Tool (duck_search)\n\n**Error:** `timeout`"));
        assert!(md.trim_end().ends_with("done"));
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("this is a long string", 10), "this is...");
        assert_eq!(truncate("ééééééé", 5), "éé...");
    }
}
