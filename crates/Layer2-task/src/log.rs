//! Task log tailing
//!
//! The task appends to `stdout.txt`/`stderr.txt` under its working
//! directory while the caller reads them. `LogTail` remembers how far it
//! has read and only hands out complete lines, so a line the task is still
//! writing is never split across two reads.

use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tracing::debug;

/// Maximum bytes read per poll
const MAX_CHUNK: u64 = 1024 * 1024;

/// Incremental reader of an append-only log file
#[derive(Debug)]
pub struct LogTail {
    path: PathBuf,
    offset: u64,
    partial: Vec<u8>,
    line_count: usize,
}

impl LogTail {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            offset: 0,
            partial: Vec::new(),
            line_count: 0,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Lines handed out so far
    pub fn line_count(&self) -> usize {
        self.line_count
    }

    /// Read newly appended complete lines
    ///
    /// A missing file yields no lines.
    pub async fn poll(&mut self) -> std::io::Result<Vec<String>> {
        let mut file = match tokio::fs::File::open(&self.path).await {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };

        let len = file.metadata().await?.len();
        if len < self.offset {
            // truncated underneath us; start over
            self.offset = 0;
            self.partial.clear();
        }
        if len == self.offset {
            return Ok(Vec::new());
        }

        file.seek(SeekFrom::Start(self.offset)).await?;
        let mut chunk = Vec::new();
        file.take(MAX_CHUNK).read_to_end(&mut chunk).await?;
        self.offset += chunk.len() as u64;
        self.partial.extend_from_slice(&chunk);

        let mut lines = Vec::new();
        while let Some(pos) = self.partial.iter().position(|b| *b == b'\n') {
            let raw: Vec<u8> = self.partial.drain(..=pos).collect();
            let line = String::from_utf8_lossy(&raw[..raw.len() - 1])
                .trim_end_matches('\r')
                .to_string();
            lines.push(line);
        }
        self.line_count += lines.len();
        Ok(lines)
    }

    /// Read what is left once the writer is gone, including an unterminated
    /// last line
    pub async fn finish(&mut self) -> std::io::Result<Vec<String>> {
        let mut lines = self.poll().await?;
        if !self.partial.is_empty() {
            lines.push(String::from_utf8_lossy(&self.partial).to_string());
            self.partial.clear();
            self.line_count += 1;
        }
        Ok(lines)
    }

    /// Forward new lines to the tracing log
    pub async fn forward(&mut self, label: &str, finished: bool) {
        let result = if finished {
            self.finish().await
        } else {
            self.poll().await
        };
        match result {
            Ok(lines) => {
                for line in lines {
                    debug!(target: "taskbox::stderr", "[{}] {}", label, line);
                }
            }
            Err(e) => debug!("Failed to tail {}: {}", self.path.display(), e),
        }
    }
}
