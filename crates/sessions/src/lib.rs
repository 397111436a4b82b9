//! Append-only JSONL transcript storage, one file per session key.
//!
//! Writers take an advisory file lock so concurrent appends from separate
//! processes interleave whole lines. Reads tolerate malformed lines rather
//! than failing the whole transcript.

use std::{
    fs::{self, File, OpenOptions},
    io::{BufRead, BufReader, Write},
    path::PathBuf,
};

use {anyhow::Result, fd_lock::RwLock};

/// JSONL transcript store rooted at a base directory.
pub struct SessionStore {
    pub base_dir: PathBuf,
}

impl SessionStore {
    pub fn new(base_dir: PathBuf) -> Self {
        Self { base_dir }
    }

    /// Sanitize a session key for use as a filename.
    pub fn key_to_filename(key: &str) -> String {
        key.replace(':', "_")
    }

    fn path_for(&self, key: &str) -> PathBuf {
        self.base_dir
            .join(format!("{}.jsonl", Self::key_to_filename(key)))
    }

    /// Append a message as a single line to the session file.
    pub async fn append(&self, key: &str, message: &serde_json::Value) -> Result<()> {
        let path = self.path_for(key);
        let line = serde_json::to_string(message)?;

        tokio::task::spawn_blocking(move || -> Result<()> {
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(&path)?;
            let mut lock = RwLock::new(file);
            let mut guard = lock
                .write()
                .map_err(|e| anyhow::anyhow!("lock failed: {e}"))?;
            writeln!(*guard, "{line}")?;
            Ok(())
        })
        .await??;

        Ok(())
    }

    /// Read all messages from a session file.
    pub async fn read(&self, key: &str) -> Result<Vec<serde_json::Value>> {
        let path = self.path_for(key);

        tokio::task::spawn_blocking(move || -> Result<Vec<serde_json::Value>> {
            if !path.exists() {
                return Ok(vec![]);
            }
            let file = File::open(&path)?;
            let reader = BufReader::new(file);
            let mut messages = Vec::new();
            for line in reader.lines() {
                let line = line?;
                let trimmed = line.trim();
                if trimmed.is_empty() {
                    continue;
                }
                match serde_json::from_str(trimmed) {
                    Ok(val) => messages.push(val),
                    Err(e) => {
                        tracing::warn!("skipping malformed JSONL line: {e}");
                    },
                }
            }
            Ok(messages)
        })
        .await?
    }

    /// Read the last N messages from a session file.
    pub async fn read_last_n(&self, key: &str, n: usize) -> Result<Vec<serde_json::Value>> {
        let all = self.read(key).await?;
        let start = all.len().saturating_sub(n);
        Ok(all[start..].to_vec())
    }

    /// Read the transcript tail bounded by both a message count and a total
    /// serialized byte size, dropping oldest messages first. The byte cap is
    /// applied to each message's compact JSON encoding.
    pub async fn tail_capped(
        &self,
        key: &str,
        max_messages: usize,
        max_bytes: usize,
    ) -> Result<Vec<serde_json::Value>> {
        let all = self.read(key).await?;

        let mut total = 0usize;
        let mut keep = 0usize;
        for val in all.iter().rev() {
            if keep >= max_messages {
                break;
            }
            let size = serde_json::to_string(val).map(|s| s.len()).unwrap_or(0);
            if keep > 0 && total + size > max_bytes {
                break;
            }
            total += size;
            keep += 1;
        }

        Ok(all[all.len() - keep..].to_vec())
    }

    /// Delete the session file.
    pub async fn clear(&self, key: &str) -> Result<()> {
        let path = self.path_for(key);

        tokio::task::spawn_blocking(move || -> Result<()> {
            if path.exists() {
                fs::remove_file(&path)?;
            }
            Ok(())
        })
        .await??;

        Ok(())
    }

    /// Count messages in a session file without parsing them.
    pub async fn count(&self, key: &str) -> Result<u32> {
        let path = self.path_for(key);

        tokio::task::spawn_blocking(move || -> Result<u32> {
            if !path.exists() {
                return Ok(0);
            }
            let file = File::open(&path)?;
            let reader = BufReader::new(file);
            let count = reader
                .lines()
                .map_while(Result::ok)
                .filter(|l| !l.trim().is_empty())
                .count();
            Ok(count as u32)
        })
        .await?
    }

    /// List all session keys by scanning JSONL files in the base directory.
    pub fn list_keys(&self) -> Vec<String> {
        let Ok(entries) = fs::read_dir(&self.base_dir) else {
            return vec![];
        };
        entries
            .filter_map(|e| e.ok())
            .filter_map(|e| {
                let name = e.file_name().to_string_lossy().to_string();
                name.strip_suffix(".jsonl").map(|s| s.replace('_', ":"))
            })
            .collect()
    }
}
