//! Diagnostic capture of synthesized audio.
//!
//! Chunks are buffered in memory per session and written to one file when
//! the session ends. Nothing here is allowed to fail a session: write errors
//! are logged and dropped.

use chrono::Local;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tokio::task::JoinHandle;

#[derive(Debug, Clone)]
pub struct AudioCapture {
    dir: PathBuf,
    extension: String,
    buffers: Arc<Mutex<HashMap<String, Vec<u8>>>>,
}

impl AudioCapture {
    pub fn new(dir: impl Into<PathBuf>, extension: impl Into<String>) -> Self {
        Self {
            dir: dir.into(),
            extension: extension.into(),
            buffers: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn append(&self, session_id: &str, payload: &[u8]) {
        if payload.is_empty() {
            return;
        }
        let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        buffers
            .entry(session_id.to_string())
            .or_default()
            .extend_from_slice(payload);
    }

    /// Bytes buffered for a session so far.
    pub fn buffered(&self, session_id: &str) -> usize {
        let buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
        buffers.get(session_id).map_or(0, Vec::len)
    }

    /// Takes the session's buffer and writes it in the background.
    ///
    /// Returns `None` when nothing was captured.
    pub fn finish(&self, session_id: &str) -> Option<JoinHandle<()>> {
        let audio = {
            let mut buffers = self.buffers.lock().unwrap_or_else(|e| e.into_inner());
            buffers.remove(session_id)?
        };
        if audio.is_empty() {
            return None;
        }

        let path = self.dir.join(self.file_name(session_id));
        let dir = self.dir.clone();
        let session_id = session_id.to_string();
        Some(tokio::spawn(async move {
            if let Err(e) = tokio::fs::create_dir_all(&dir).await {
                tracing::warn!(session_id = %session_id, dir = %dir.display(), "failed to create capture dir: {}", e);
                return;
            }
            match tokio::fs::write(&path, &audio).await {
                Ok(()) => tracing::info!(
                    session_id = %session_id,
                    path = %path.display(),
                    bytes = audio.len(),
                    "captured synthesized audio"
                ),
                Err(e) => tracing::warn!(
                    session_id = %session_id,
                    path = %path.display(),
                    "failed to write captured audio: {}",
                    e
                ),
            }
        }))
    }

    fn file_name(&self, session_id: &str) -> String {
        let prefix: String = session_id.chars().take(8).collect();
        format!(
            "tts_audio_{}_{}.{}",
            prefix,
            Local::now().format("%Y%m%d_%H%M%S"),
            self.extension
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn finish_writes_one_file_per_session() {
        let tmp = tempfile::tempdir().unwrap();
        let capture = AudioCapture::new(tmp.path().join("audio"), "mp3");

        capture.append("0123456789abcdef", &[1, 2]);
        capture.append("0123456789abcdef", &[3]);
        capture.append("other-session", &[9]);
        assert_eq!(capture.buffered("0123456789abcdef"), 3);

        capture.finish("0123456789abcdef").unwrap().await.unwrap();

        let entries: Vec<_> = std::fs::read_dir(tmp.path().join("audio"))
            .unwrap()
            .map(|e| e.unwrap().path())
            .collect();
        assert_eq!(entries.len(), 1);
        let name = entries[0].file_name().unwrap().to_str().unwrap().to_string();
        assert!(name.starts_with("tts_audio_01234567_"), "{}", name);
        assert!(name.ends_with(".mp3"), "{}", name);
        assert_eq!(std::fs::read(&entries[0]).unwrap(), vec![1, 2, 3]);

        assert_eq!(capture.buffered("0123456789abcdef"), 0);
        assert_eq!(capture.buffered("other-session"), 1);
    }

    #[tokio::test]
    async fn empty_sessions_write_nothing() {
        let tmp = tempfile::tempdir().unwrap();
        let capture = AudioCapture::new(tmp.path(), "pcm");

        capture.append("s1", &[]);
        assert!(capture.finish("s1").is_none());

        assert!(capture.finish("never-seen").is_none());

        assert_eq!(std::fs::read_dir(tmp.path()).unwrap().count(), 0);
    }
}
