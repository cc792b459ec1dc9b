//! Per-user usage log.
//!
//! Every `/conversation` request, answered or failed, appends one JSON object
//! to `<log_dir>/<user>.log`. Lines are written with a single `write_all` on a
//! file opened in append mode, so concurrent requests for the same user never
//! interleave within a line.

use std::path::{Path, PathBuf};

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::{fs, io::AsyncWriteExt as _};
use tracing::{debug, warn};

/// Append-only usage log rooted at one directory.
///
/// Built once at startup from `server.log_dir`; a config hot-reload does not
/// move it.
#[derive(Debug, Clone)]
pub struct UsageLog {
    dir: PathBuf,
}

/// One usage line.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct UsageEntry {
    /// Client-supplied timestamp, echoed as-is.
    #[serde(default)]
    pub ts: Value,
    pub ip: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub bot: Option<String>,
    /// Total tokens, when the backend reports them.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tokens: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub recorded_at: DateTime<Utc>,
}

impl UsageEntry {
    pub fn answered(ts: Value, ip: &str, bot: &str, tokens: Option<u64>) -> Self {
        Self {
            ts,
            ip: ip.to_owned(),
            bot: Some(bot.to_owned()),
            tokens,
            error: None,
            request_id: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn failed(ts: Value, ip: &str, error: impl Into<String>) -> Self {
        Self {
            ts,
            ip: ip.to_owned(),
            bot: None,
            tokens: None,
            error: Some(error.into()),
            request_id: None,
            recorded_at: Utc::now(),
        }
    }

    pub fn with_request_id(mut self, request_id: Option<&str>) -> Self {
        self.request_id = request_id.map(str::to_owned);
        self
    }
}

impl UsageLog {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of `user`'s log file. Rejects identifiers that would escape the log directory.
    pub fn path_for(&self, user: &str) -> anyhow::Result<PathBuf> {
        anyhow::ensure!(
            !user.is_empty()
                && !user.contains(['/', '\\', '\0'])
                && !user.contains(".."),
            "user `{user}` is not usable as a log file name"
        );
        Ok(self.dir.join(format!("{user}.log")))
    }

    /// Append `entry` to `user`'s log, creating the directory and file as needed.
    pub async fn append(&self, user: &str, entry: &UsageEntry) -> anyhow::Result<()> {
        let path = self.path_for(user)?;
        fs::create_dir_all(&self.dir)
            .await
            .with_context(|| format!("creating log directory {}", self.dir.display()))?;

        let mut line = serde_json::to_string(entry).context("serializing usage entry")?;
        line.push('\n');

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .with_context(|| format!("opening {}", path.display()))?;
        file.write_all(line.as_bytes())
            .await
            .with_context(|| format!("writing {}", path.display()))?;

        debug!(user, path = %path.display(), "usage recorded");
        Ok(())
    }

    /// [`append`][Self::append], logging instead of returning a failure.
    pub async fn record(&self, user: &str, entry: &UsageEntry) {
        if let Err(e) = self.append(user, entry).await {
            warn!(user, error = %format!("{e:#}"), "failed to write usage log");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn read_lines(path: &Path) -> Vec<Value> {
        let text = fs::read_to_string(path).await.unwrap();
        text.lines().map(|l| serde_json::from_str(l).unwrap()).collect()
    }

    // -----------------------------------------------------------------------
    // append
    // -----------------------------------------------------------------------

    #[tokio::test]
    async fn append_creates_directory_and_writes_one_line_per_entry() {
        let tmp = tempfile::tempdir().unwrap();
        let log = UsageLog::new(tmp.path().join("nested/logs"));

        log.append("alice", &UsageEntry::answered(json!(1700), "10.0.0.1", "GPT3.5", Some(76)))
            .await
            .unwrap();
        log.append("alice", &UsageEntry::failed(json!("t2"), "10.0.0.1", "boom"))
            .await
            .unwrap();

        let lines = read_lines(&log.path_for("alice").unwrap()).await;
        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0]["ts"], 1700);
        assert_eq!(lines[0]["ip"], "10.0.0.1");
        assert_eq!(lines[0]["bot"], "GPT3.5");
        assert_eq!(lines[0]["tokens"], 76);
        assert!(lines[0].get("error").is_none());
        assert_eq!(lines[1]["error"], "boom");
        assert!(lines[1].get("bot").is_none());
        assert!(lines[1]["recorded_at"].is_string());
    }

    #[tokio::test]
    async fn users_get_separate_files() {
        let tmp = tempfile::tempdir().unwrap();
        let log = UsageLog::new(tmp.path());

        log.record("alice", &UsageEntry::answered(Value::Null, "ip", "Bing", None)).await;
        log.record("bob", &UsageEntry::answered(Value::Null, "ip", "Sydney", None)).await;

        assert_eq!(read_lines(&tmp.path().join("alice.log")).await.len(), 1);
        assert_eq!(read_lines(&tmp.path().join("bob.log")).await[0]["bot"], "Sydney");
    }

    #[tokio::test]
    async fn request_id_is_recorded_when_present() {
        let tmp = tempfile::tempdir().unwrap();
        let log = UsageLog::new(tmp.path());
        let entry = UsageEntry::answered(Value::Null, "ip", "GPT4", None).with_request_id(Some("req-7"));

        log.append("carol", &entry).await.unwrap();

        let lines = read_lines(&tmp.path().join("carol.log")).await;
        assert_eq!(lines[0]["request_id"], "req-7");
        assert!(lines[0].get("tokens").is_none());
    }

    // -----------------------------------------------------------------------
    // File names
    // -----------------------------------------------------------------------

    #[test]
    fn path_escaping_user_ids_are_rejected() {
        let log = UsageLog::new("/var/log/chat-relay");
        for user in ["", "../etc/passwd", "a/b", "a\\b", "..", "x..y"] {
            assert!(log.path_for(user).is_err(), "accepted {user:?}");
        }
        assert_eq!(
            log.path_for("alice").unwrap(),
            PathBuf::from("/var/log/chat-relay/alice.log")
        );
    }

    #[tokio::test]
    async fn record_swallows_write_failures() {
        let tmp = tempfile::tempdir().unwrap();
        // A file where the directory should be.
        let blocker = tmp.path().join("logs");
        fs::write(&blocker, b"").await.unwrap();
        let log = UsageLog::new(&blocker);

        log.record("alice", &UsageEntry::failed(Value::Null, "ip", "x")).await;
        assert!(log.append("alice", &UsageEntry::failed(Value::Null, "ip", "x")).await.is_err());
    }
}
