//! Saved observations
//!
//! Topic pages and log files a scenario looked at are written next to the run
//! so a failure can be inspected afterwards. Writing is best effort.

use std::path::PathBuf;

use tracing::{debug, warn};

#[derive(Debug, Clone)]
pub struct ArtifactStore {
    dir: Option<PathBuf>,
}

impl ArtifactStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: Some(dir.into()),
        }
    }

    /// Store that drops everything
    pub fn disabled() -> Self {
        Self { dir: None }
    }

    /// Write `contents` to `name`; failures are logged and swallowed
    pub fn save(&self, name: &str, contents: &str) -> Option<PathBuf> {
        let dir = self.dir.as_ref()?;
        let path = dir.join(sanitize(name));

        let result = std::fs::create_dir_all(dir).and_then(|_| std::fs::write(&path, contents));
        match result {
            Ok(()) => {
                debug!(path = %path.display(), bytes = contents.len(), "Saved artifact");
                Some(path)
            }
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Failed to save artifact");
                None
            }
        }
    }

    /// Save a JSON body pretty-printed; unparseable bodies are saved verbatim
    pub fn save_json(&self, name: &str, raw: &str) -> Option<PathBuf> {
        let pretty = serde_json::from_str::<serde_json::Value>(raw)
            .and_then(|v| serde_json::to_string_pretty(&v))
            .unwrap_or_else(|_| raw.to_string());
        self.save(name, &pretty)
    }
}

/// Keep artifact names inside the artifact directory
fn sanitize(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' => '_',
            c => c,
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_save_creates_directory() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path().join("nested/artifacts"));

        let path = store.save("agent-win-agent.log", "hello\n").unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "hello\n");
    }

    #[test]
    fn test_save_json_pretty_prints() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());

        let path = store.save_json("topic-sts_metrics.json", r#"{"messages":[]}"#).unwrap();
        let written = std::fs::read_to_string(path).unwrap();
        assert!(written.contains("\n"));
        assert!(written.contains("\"messages\": []"));

        let path = store.save_json("raw.json", "not json").unwrap();
        assert_eq!(std::fs::read_to_string(path).unwrap(), "not json");
    }

    #[test]
    fn test_names_are_flattened() {
        let dir = tempfile::tempdir().unwrap();
        let store = ArtifactStore::new(dir.path());

        let path = store.save("../escape.log", "x").unwrap();
        assert_eq!(path.parent().unwrap(), dir.path());
        assert_eq!(sanitize(r"c:\logs\agent.log"), "c__logs_agent.log");
    }

    #[test]
    fn test_write_failure_is_not_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let blocker = dir.path().join("blocker");
        std::fs::write(&blocker, "file, not a directory").unwrap();

        let store = ArtifactStore::new(blocker.join("sub"));
        assert!(store.save("x.log", "data").is_none());
        assert!(ArtifactStore::disabled().save("x.log", "data").is_none());
    }
}
