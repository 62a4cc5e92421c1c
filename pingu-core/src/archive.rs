// Fuzzer/data-bundle/testcase archive handling.
//
// The teacher shells out to platform archive tools where it needs to unpack
// anything at all; this bot's archives are always gzipped tarballs, so this
// module wraps `tar`+`flate2` directly instead of spawning a subprocess.

use anyhow::{Context, Result};
use std::fs::File;
use std::path::Path;

pub fn unpack(archive_path: &Path, dest_dir: &Path) -> Result<()> {
    std::fs::create_dir_all(dest_dir)
        .with_context(|| format!("creating unpack destination: {}", dest_dir.display()))?;

    let file = File::open(archive_path)
        .with_context(|| format!("opening archive: {}", archive_path.display()))?;
    let decoder = flate2::read::GzDecoder::new(file);
    let mut archive = tar::Archive::new(decoder);
    archive
        .unpack(dest_dir)
        .with_context(|| format!("unpacking archive: {}", archive_path.display()))?;

    Ok(())
}

pub fn pack(dest_archive: &Path, src_dir: &Path) -> Result<()> {
    let file = File::create(dest_archive)
        .with_context(|| format!("creating archive: {}", dest_archive.display()))?;
    let encoder = flate2::write::GzEncoder::new(file, flate2::Compression::default());
    let mut builder = tar::Builder::new(encoder);
    builder
        .append_dir_all(".", src_dir)
        .with_context(|| format!("packing archive from: {}", src_dir.display()))?;
    builder.into_inner()?.finish()?;

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn test_pack_unpack_round_trip() {
        let src = tempdir().unwrap();
        std::fs::write(src.path().join("seed"), b"hello").unwrap();

        let archive_dir = tempdir().unwrap();
        let archive_path = archive_dir.path().join("bundle.tar.gz");
        pack(&archive_path, src.path()).unwrap();

        let dest = tempdir().unwrap();
        unpack(&archive_path, dest.path()).unwrap();

        let content = std::fs::read(dest.path().join("seed")).unwrap();
        assert_eq!(content, b"hello");
    }
}
