//! Discovery and reading of input documents

use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tracing::{debug, warn};
use walkdir::WalkDir;

use crate::error::{IngestError, Result};

/// A candidate input file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SourceFile {
    /// Path relative to the source root, `/`-separated
    pub path: String,
    pub size_bytes: u64,
}

/// Where documents come from
///
/// `list` returns every file currently present, sorted by path; filtering out
/// already processed files is the ledger's job.
#[async_trait]
pub trait DocumentSource: Send + Sync {
    async fn list(&self) -> Result<Vec<SourceFile>>;

    async fn read(&self, path: &str) -> Result<Vec<u8>>;

    /// Human-readable location for logs
    fn describe(&self) -> String;
}

/// Files under a local directory, searched recursively
#[derive(Debug, Clone)]
pub struct LocalDirSource {
    root: PathBuf,
}

impl LocalDirSource {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }
}

/// Hidden files and marker files such as `_SUCCESS` are never documents
fn is_skipped(name: &str) -> bool {
    name.starts_with('.') || name.starts_with('_')
}

fn scan(root: &Path) -> Result<Vec<SourceFile>> {
    if !root.exists() {
        debug!(root = %root.display(), "Input directory does not exist yet");
        return Ok(Vec::new());
    }

    let mut files = Vec::new();
    let walker = WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_entry(|e| e.depth() == 0 || !is_skipped(&e.file_name().to_string_lossy()));

    for entry in walker {
        let entry = match entry {
            Ok(entry) => entry,
            Err(e) => {
                warn!(error = %e, "Skipping unreadable directory entry");
                continue;
            },
        };
        if !entry.file_type().is_file() {
            continue;
        }

        let Ok(relative) = entry.path().strip_prefix(root) else {
            continue;
        };
        let path = relative
            .components()
            .map(|c| c.as_os_str().to_string_lossy())
            .collect::<Vec<_>>()
            .join("/");
        let size_bytes = entry.metadata().map(|m| m.len()).unwrap_or(0);

        files.push(SourceFile { path, size_bytes });
    }

    files.sort_by(|a, b| a.path.cmp(&b.path));
    Ok(files)
}

#[async_trait]
impl DocumentSource for LocalDirSource {
    async fn list(&self) -> Result<Vec<SourceFile>> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || scan(&root))
            .await
            .map_err(|e| IngestError::Worker(format!("discovery task failed: {}", e)))?
    }

    async fn read(&self, path: &str) -> Result<Vec<u8>> {
        tokio::fs::read(self.root.join(path))
            .await
            .map_err(|source| IngestError::Source {
                path: path.to_string(),
                source,
            })
    }

    fn describe(&self) -> String {
        self.root.display().to_string()
    }
}
