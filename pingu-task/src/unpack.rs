// Unpack task: downloads a named data bundle's archive and re-uploads its
// contents as individual blobs for inspection, without running any target.
// Grounded on `pingu_core::archive::unpack` and `SyncedDir`'s push logic
// (`pingu_core::syncdir`).

use crate::tasks::config::CommonConfig;
use anyhow::{Context, Result};
use pingu_core::archive;
use pingu_core::storage::StoragePath;

pub async fn run(common: CommonConfig) -> Result<()> {
    let bundle_name = common.argument.clone();
    let bundle = common
        .api
        .get_data_bundle(&bundle_name)
        .await
        .with_context(|| format!("looking up data bundle {bundle_name}"))?;

    let work_dir = common.environment.root_dir.join("unpack").join(&bundle_name);
    let download_dir = work_dir.join("download");
    let unpacked_dir = work_dir.join("unpacked");
    tokio::fs::create_dir_all(&download_dir).await?;

    let blob_path = StoragePath::parse(&bundle.blobstore_path)?;
    let archive_path = download_dir.join("bundle.tar.gz");
    common
        .storage
        .copy_file_from(&blob_path, &archive_path)
        .await
        .context("downloading data bundle archive")?;

    archive::unpack(&archive_path, &unpacked_dir).context("unpacking data bundle")?;

    let mut entries = tokio::fs::read_dir(&unpacked_dir).await?;
    let mut uploaded = 0usize;
    while let Some(entry) = entries.next_entry().await? {
        if !entry.file_type().await?.is_file() {
            continue;
        }
        let name = entry.file_name().to_string_lossy().into_owned();
        let contents = tokio::fs::read(entry.path()).await?;
        let dest = StoragePath::new("blobs", format!("{bundle_name}/unpacked/{name}"))?;
        common.storage.write_data(&dest, contents).await?;
        uploaded += 1;
    }

    debug!("unpack: uploaded {} files from bundle {}", uploaded, bundle_name);
    Ok(())
}
