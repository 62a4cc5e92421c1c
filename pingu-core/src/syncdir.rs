// Corpus/build directory <-> object-store synchronization.
//
// Rewritten against `crate::storage::StorageClient` in place of the
// teacher's `az_copy` shellout + `BlobUploader`, since the object store here
// is S3-shaped rather than Azure Blob. The push/pull/continuous-sync/
// monitor-and-upload shape is kept as-is.

use crate::{
    jitter::delay_with_jitter,
    monitor::DirectoryMonitor,
    storage::{StorageClient, StoragePath},
};
use anyhow::{Context, Result};
use pingu_telemetry::{Event, EventData};
use std::{path::PathBuf, sync::Arc, time::Duration};
use tokio::fs;

#[derive(Debug, Clone, Copy)]
pub enum SyncOperation {
    Push,
    Pull,
}

const DELAY: Duration = Duration::from_secs(10);
const DEFAULT_CONTINUOUS_SYNC_DELAY_SECONDS: u64 = 60;

#[derive(Debug, Clone, PartialEq, Eq, serde::Deserialize)]
pub struct SyncedDir {
    pub path: PathBuf,
    pub remote: StoragePath,
}

impl SyncedDir {
    pub async fn sync(
        &self,
        storage: &dyn StorageClient,
        operation: SyncOperation,
        delete_dst: bool,
    ) -> Result<()> {
        verbose!("syncing {:?} {}", operation, self.path.display());

        match operation {
            SyncOperation::Push => self.push(storage, delete_dst).await,
            SyncOperation::Pull => self.pull(storage, delete_dst).await,
        }
    }

    async fn push(&self, storage: &dyn StorageClient, delete_dst: bool) -> Result<()> {
        let local_files = crate::fs::list_files(&self.path).await?;
        let mut remote_keys = std::collections::HashSet::new();

        for file in &local_files {
            let name = file
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| format_err!("non-utf8 file name: {}", file.display()))?;
            let remote_path = self.remote.join(name);
            remote_keys.insert(remote_path.key().to_owned());
            storage
                .copy_file_to(file, &remote_path)
                .await
                .with_context(|| format!("push: {} -> {}", file.display(), remote_path))?;
        }

        if delete_dst {
            for blob in storage.list_blobs(&self.remote).await? {
                if !remote_keys.contains(blob.path.key()) {
                    storage.delete(&blob.path).await?;
                }
            }
        }

        Ok(())
    }

    async fn pull(&self, storage: &dyn StorageClient, delete_dst: bool) -> Result<()> {
        self.init().await?;

        let blobs = storage.list_blobs(&self.remote).await?;
        let mut local_names = std::collections::HashSet::new();

        for blob in &blobs {
            let name = blob
                .path
                .file_name()
                .ok_or_else(|| format_err!("blob with no name: {}", blob.path))?;
            local_names.insert(name.to_owned());
            let dst = self.path.join(name);
            storage
                .copy_file_from(&blob.path, &dst)
                .await
                .with_context(|| format!("pull: {} -> {}", blob.path, dst.display()))?;
        }

        if delete_dst {
            for file in crate::fs::list_files(&self.path).await? {
                let keep = file
                    .file_name()
                    .and_then(|n| n.to_str())
                    .map(|n| local_names.contains(n))
                    .unwrap_or(false);
                if !keep {
                    fs::remove_file(&file).await?;
                }
            }
        }

        Ok(())
    }

    pub async fn init_pull(&self, storage: &dyn StorageClient) -> Result<()> {
        self.init().await?;
        self.sync(storage, SyncOperation::Pull, false).await
    }

    pub async fn init(&self) -> Result<()> {
        match fs::metadata(&self.path).await {
            Ok(m) => {
                if m.is_dir() {
                    Ok(())
                } else {
                    bail!("File with name '{}' already exists", self.path.display());
                }
            }
            Err(_) => fs::create_dir(&self.path).await.with_context(|| {
                format!("unable to create init SyncedDir: {}", self.path.display())
            }),
        }
    }

    pub async fn sync_pull(&self, storage: &dyn StorageClient) -> Result<()> {
        self.sync(storage, SyncOperation::Pull, false).await
    }

    pub async fn sync_push(&self, storage: &dyn StorageClient) -> Result<()> {
        self.sync(storage, SyncOperation::Push, false).await
    }

    pub async fn continuous_sync(
        &self,
        storage: Arc<dyn StorageClient>,
        operation: SyncOperation,
        delay_seconds: Option<u64>,
    ) -> Result<()> {
        let delay_seconds = delay_seconds.unwrap_or(DEFAULT_CONTINUOUS_SYNC_DELAY_SECONDS);
        if delay_seconds == 0 {
            return Ok(());
        }
        let delay = Duration::from_secs(delay_seconds);

        loop {
            self.sync(storage.as_ref(), operation, false).await?;
            delay_with_jitter(delay).await;
        }
    }

    async fn file_uploader_monitor(
        &self,
        storage: Arc<dyn StorageClient>,
        event: Event,
    ) -> Result<()> {
        verbose!("monitoring {}", self.path.display());

        let mut monitor = DirectoryMonitor::new(self.path.clone())?;
        monitor.start().await?;

        while let Some(item) = monitor.next_file().await? {
            event!(event.clone(); EventData::Path = item.display().to_string());

            let name = item
                .file_name()
                .and_then(|n| n.to_str())
                .ok_or_else(|| format_err!("non-utf8 file name: {}", item.display()))?;
            let remote_path = self.remote.join(name);

            if let Err(err) = storage.copy_file_to(&item, &remote_path).await {
                bail!(
                    "Couldn't upload file.  path:{} dir:{} err:{}",
                    item.display(),
                    self.path.display(),
                    err
                );
            }
        }

        Ok(())
    }

    /// Monitor a directory for results.
    ///
    /// This function does not require the directory to exist before it is called.
    /// If the directory is reset (unlinked and recreated), this function will stop
    /// listening to the original filesystem node, and begin watching the new one
    /// once it has been created.
    ///
    /// The intent of this is to support use cases where we usually want a directory
    /// to be initialized, but a user-supplied binary (such as a fuzzing engine)
    /// logically owns a directory, and may reset it.
    pub async fn monitor_results(
        &self,
        storage: Arc<dyn StorageClient>,
        event: Event,
    ) -> Result<()> {
        loop {
            verbose!("waiting to monitor {}", self.path.display());

            while fs::metadata(&self.path).await.is_err() {
                verbose!("dir {} not ready to monitor, delaying", self.path.display());
                delay_with_jitter(DELAY).await;
            }

            verbose!("starting monitor for {}", self.path.display());
            self.file_uploader_monitor(storage.clone(), event.clone())
                .await?;
        }
    }
}

pub async fn continuous_sync(
    storage: Arc<dyn StorageClient>,
    dirs: &[SyncedDir],
    operation: SyncOperation,
    delay_seconds: Option<u64>,
) -> Result<()> {
    let delay_seconds = delay_seconds.unwrap_or(DEFAULT_CONTINUOUS_SYNC_DELAY_SECONDS);
    if delay_seconds == 0 {
        return Ok(());
    }

    let delay = Duration::from_secs(delay_seconds);

    loop {
        for dir in dirs {
            dir.sync(storage.as_ref(), operation, false).await?;
        }
        delay_with_jitter(delay).await;
    }
}
