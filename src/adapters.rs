//! Small adapter traits for the three narrow surfaces the router delegates
//! to without owning any domain model of its own (spec.md §4.4: `folder_*`,
//! `blob_*`, `task_*`). Kept intentionally thin — these are not full
//! subsystems, just enough to satisfy the envelope contract.

use crate::errors::{PylonError, PylonResult};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tokio::sync::Mutex;

// ─── Folder adapter ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FolderEntry {
    pub name: String,
    pub path: String,
    pub is_dir: bool,
}

#[async_trait]
pub trait FolderAdapter: Send + Sync {
    async fn list(&self, path: &str) -> PylonResult<Vec<FolderEntry>>;
    async fn create(&self, path: &str) -> PylonResult<()>;
    async fn rename(&self, from: &str, to: &str) -> PylonResult<()>;
}

/// Plain-filesystem implementation, rooted at a workspace's working directory.
pub struct FsFolderAdapter {
    root: PathBuf,
}

impl FsFolderAdapter {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    fn resolve(&self, path: &str) -> PylonResult<PathBuf> {
        let joined = self.root.join(path.trim_start_matches(['/', '\\']));
        let canonical_root = self.root.canonicalize().unwrap_or_else(|_| self.root.clone());
        // Reject attempts to escape the workspace root via `..`.
        let parent = joined.parent().map(Path::to_path_buf).unwrap_or_else(|| joined.clone());
        if parent.exists() {
            let canonical_parent = parent.canonicalize().map_err(|e| PylonError::InvalidInput(format!("invalid path: {e}")))?;
            if !canonical_parent.starts_with(&canonical_root) {
                return Err(PylonError::InvalidInput("path escapes workspace root".into()));
            }
        }
        Ok(joined)
    }
}

#[async_trait]
impl FolderAdapter for FsFolderAdapter {
    async fn list(&self, path: &str) -> PylonResult<Vec<FolderEntry>> {
        let target = self.resolve(path)?;
        let mut entries = Vec::new();
        let mut read_dir = tokio::fs::read_dir(&target).await?;
        while let Some(entry) = read_dir.next_entry().await? {
            let file_type = entry.file_type().await?;
            entries.push(FolderEntry {
                name: entry.file_name().to_string_lossy().into_owned(),
                path: entry.path().to_string_lossy().into_owned(),
                is_dir: file_type.is_dir(),
            });
        }
        entries.sort_by(|a, b| a.name.cmp(&b.name));
        Ok(entries)
    }

    async fn create(&self, path: &str) -> PylonResult<()> {
        let target = self.resolve(path)?;
        tokio::fs::create_dir_all(&target).await?;
        Ok(())
    }

    async fn rename(&self, from: &str, to: &str) -> PylonResult<()> {
        let from = self.resolve(from)?;
        let to = self.resolve(to)?;
        tokio::fs::rename(from, to).await?;
        Ok(())
    }
}

// ─── Blob adapter ──────────────────────────────────────────────────────────

/// Reassembles a chunked upload (`blob_start` / `blob_chunk` / `blob_end`)
/// into a file under `{data_dir}/blobs/`.
pub struct BlobAdapter {
    blob_dir: PathBuf,
    in_progress: Mutex<HashMap<String, BlobUpload>>,
}

struct BlobUpload {
    path: PathBuf,
    file: tokio::fs::File,
}

impl BlobAdapter {
    pub fn new(data_dir: PathBuf) -> Self {
        Self {
            blob_dir: data_dir.join("blobs"),
            in_progress: Mutex::new(HashMap::new()),
        }
    }

    pub async fn start(&self, blob_id: &str, filename: &str) -> PylonResult<()> {
        tokio::fs::create_dir_all(&self.blob_dir).await?;
        let path = self.blob_dir.join(format!("{blob_id}-{filename}"));
        let file = tokio::fs::File::create(&path).await?;
        self.in_progress.lock().await.insert(blob_id.to_string(), BlobUpload { path, file });
        Ok(())
    }

    pub async fn chunk(&self, blob_id: &str, data: &[u8]) -> PylonResult<()> {
        use tokio::io::AsyncWriteExt;
        let mut uploads = self.in_progress.lock().await;
        let upload = uploads.get_mut(blob_id).ok_or_else(|| PylonError::NotFound(format!("blob {blob_id}")))?;
        upload.file.write_all(data).await?;
        Ok(())
    }

    /// Finalizes the upload and returns the on-disk path.
    pub async fn end(&self, blob_id: &str) -> PylonResult<PathBuf> {
        use tokio::io::AsyncWriteExt;
        let mut upload = self
            .in_progress
            .lock()
            .await
            .remove(blob_id)
            .ok_or_else(|| PylonError::NotFound(format!("blob {blob_id}")))?;
        upload.file.flush().await?;
        Ok(upload.path)
    }
}

// ─── Task adapter ──────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TaskSummary {
    pub id: String,
    pub title: String,
    pub status: String,
}

/// Reads/writes a workspace's tasks as one markdown file per task under
/// `{workingDir}/.pylon/tasks/{id}.md`, with a `status: <value>` front-matter
/// line — narrow enough to satisfy `task_list`/`task_get`/`task_update_status`
/// without importing a task-management subsystem.
pub struct TaskAdapter {
    tasks_dir: PathBuf,
}

impl TaskAdapter {
    pub fn new(workspace_dir: PathBuf) -> Self {
        Self {
            tasks_dir: workspace_dir.join(".pylon").join("tasks"),
        }
    }

    fn parse(id: &str, contents: &str) -> TaskSummary {
        let mut status = "pending".to_string();
        let mut title = id.to_string();
        for line in contents.lines() {
            if let Some(rest) = line.strip_prefix("status:") {
                status = rest.trim().to_string();
            } else if let Some(rest) = line.strip_prefix("# ") {
                title = rest.trim().to_string();
            }
        }
        TaskSummary { id: id.to_string(), title, status }
    }

    pub async fn list(&self) -> PylonResult<Vec<TaskSummary>> {
        let mut tasks = Vec::new();
        let mut read_dir = match tokio::fs::read_dir(&self.tasks_dir).await {
            Ok(r) => r,
            Err(_) => return Ok(tasks),
        };
        while let Some(entry) = read_dir.next_entry().await? {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("md") {
                continue;
            }
            let id = path.file_stem().unwrap_or_default().to_string_lossy().into_owned();
            let contents = tokio::fs::read_to_string(&path).await?;
            tasks.push(Self::parse(&id, &contents));
        }
        tasks.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(tasks)
    }

    pub async fn get(&self, id: &str) -> PylonResult<TaskSummary> {
        let path = self.tasks_dir.join(format!("{id}.md"));
        let contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|_| PylonError::NotFound(format!("task {id}")))?;
        Ok(Self::parse(id, &contents))
    }

    pub async fn update_status(&self, id: &str, status: &str) -> PylonResult<()> {
        let path = self.tasks_dir.join(format!("{id}.md"));
        let mut contents = tokio::fs::read_to_string(&path)
            .await
            .map_err(|_| PylonError::NotFound(format!("task {id}")))?;
        let mut lines: Vec<String> = contents.lines().map(str::to_string).collect();
        if let Some(line) = lines.iter_mut().find(|l| l.starts_with("status:")) {
            *line = format!("status: {status}");
        } else {
            lines.insert(0, format!("status: {status}"));
        }
        contents = lines.join("\n");
        tokio::fs::write(&path, contents).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn folder_adapter_lists_and_creates() {
        let tmp = tempfile::tempdir().unwrap();
        let adapter = FsFolderAdapter::new(tmp.path().to_path_buf());
        adapter.create("sub").await.unwrap();
        let entries = adapter.list(".").await.unwrap();
        assert!(entries.iter().any(|e| e.name == "sub" && e.is_dir));
    }

    #[tokio::test]
    async fn folder_adapter_rejects_path_escape() {
        let tmp = tempfile::tempdir().unwrap();
        let adapter = FsFolderAdapter::new(tmp.path().to_path_buf());
        assert!(adapter.list("../../../../../../etc").await.is_err());
    }

    #[tokio::test]
    async fn blob_adapter_round_trips_chunks() {
        let tmp = tempfile::tempdir().unwrap();
        let adapter = BlobAdapter::new(tmp.path().to_path_buf());
        adapter.start("b1", "f.txt").await.unwrap();
        adapter.chunk("b1", b"hello ").await.unwrap();
        adapter.chunk("b1", b"world").await.unwrap();
        let path = adapter.end("b1").await.unwrap();
        let contents = tokio::fs::read_to_string(path).await.unwrap();
        assert_eq!(contents, "hello world");
    }

    #[tokio::test]
    async fn task_adapter_updates_status() {
        let tmp = tempfile::tempdir().unwrap();
        let dir = tmp.path().join(".pylon").join("tasks");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        tokio::fs::write(dir.join("t1.md"), "# Fix bug\nstatus: pending\n").await.unwrap();

        let adapter = TaskAdapter::new(tmp.path().to_path_buf());
        let summary = adapter.get("t1").await.unwrap();
        assert_eq!(summary.status, "pending");
        adapter.update_status("t1", "done").await.unwrap();
        let summary = adapter.get("t1").await.unwrap();
        assert_eq!(summary.status, "done");
    }
}
