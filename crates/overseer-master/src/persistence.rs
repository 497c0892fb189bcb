// Durable storage for build run history, keyed by run id.

use anyhow::{Context, Result};
use async_trait::async_trait;
use overseer_common::model::BuildRun;
use std::path::PathBuf;
use uuid::Uuid;

/// Persistence collaborator: a durable store for build run records.
#[async_trait]
pub trait BuildStore: Send + Sync {
    /// Write (or overwrite) a run record.
    async fn save(&self, run: &BuildRun) -> Result<()>;

    /// Load a run record by id.
    async fn load(&self, run_id: Uuid) -> Result<Option<BuildRun>>;

    /// List all stored run ids.
    async fn list(&self) -> Result<Vec<Uuid>>;
}

/// File-backed store: one pretty-printed JSON document per run under the
/// store directory. Survives master restarts.
pub struct FileBuildStore {
    root: PathBuf,
}

impl FileBuildStore {
    /// Create a store rooted at `root`, creating the directory if needed.
    pub fn new(root: impl Into<PathBuf>) -> Result<Self> {
        let root = root.into();
        std::fs::create_dir_all(&root)
            .with_context(|| format!("Failed to create build store directory {:?}", root))?;
        Ok(Self { root })
    }

    fn path_for(&self, run_id: Uuid) -> PathBuf {
        self.root.join(format!("{}.json", run_id))
    }
}

#[async_trait]
impl BuildStore for FileBuildStore {
    async fn save(&self, run: &BuildRun) -> Result<()> {
        let path = self.path_for(run.run_id);
        let body = serde_json::to_vec_pretty(run).context("Failed to serialize run record")?;

        // Write to a temp name then rename, so a crash never leaves a
        // truncated record under the real name.
        let tmp = self.root.join(format!(".{}.tmp", run.run_id));
        tokio::fs::write(&tmp, &body)
            .await
            .with_context(|| format!("Failed to write run record {:?}", tmp))?;
        tokio::fs::rename(&tmp, &path)
            .await
            .with_context(|| format!("Failed to move run record into place at {:?}", path))?;
        Ok(())
    }

    async fn load(&self, run_id: Uuid) -> Result<Option<BuildRun>> {
        let path = self.path_for(run_id);
        let body = match tokio::fs::read(&path).await {
            Ok(body) => body,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => {
                return Err(e).with_context(|| format!("Failed to read run record {:?}", path))
            }
        };
        let run = serde_json::from_slice(&body)
            .with_context(|| format!("Failed to parse run record {:?}", path))?;
        Ok(Some(run))
    }

    async fn list(&self) -> Result<Vec<Uuid>> {
        let mut ids = Vec::new();
        let mut entries = tokio::fs::read_dir(&self.root)
            .await
            .with_context(|| format!("Failed to read build store directory {:?}", self.root))?;
        while let Some(entry) = entries.next_entry().await? {
            let name = entry.file_name();
            let Some(name) = name.to_str() else { continue };
            if let Some(stem) = name.strip_suffix(".json") {
                if let Ok(id) = stem.parse::<Uuid>() {
                    ids.push(id);
                }
            }
        }
        Ok(ids)
    }
}
