// Global LSan suppressions-file management (`spec.md` §4.14 step 5, §9
// design notes). Entries are tagged with the testcase that produced them
// so a later materialisation can exclude its own entry — otherwise a known
// leak would suppress itself out of its own reproduction.

use anyhow::{Context, Result};
use std::path::{Path, PathBuf};
use tokio::fs;
use uuid::Uuid;

const SUPPRESSIONS_FILE: &str = "lsan_suppressions.txt";

fn global_path(root_dir: &Path) -> PathBuf {
    root_dir.join("etc").join(SUPPRESSIONS_FILE)
}

fn tag(testcase_id: Uuid) -> String {
    format!("# testcase:{testcase_id}")
}

/// Appends a suppression for `testcase_id`'s crash, called when analysis
/// finds a security-relevant leak and LSan is enabled (`spec.md` §4.12
/// step 5).
pub async fn update_global_blacklist(
    root_dir: &Path,
    testcase_id: Uuid,
    pattern: &str,
) -> Result<()> {
    let path = global_path(root_dir);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).await?;
    }

    let line = format!("leak:{pattern}  {}\n", tag(testcase_id));
    let mut existing = fs::read_to_string(&path).await.unwrap_or_default();
    if existing.contains(line.trim_end()) {
        return Ok(());
    }
    existing.push_str(&line);
    fs::write(&path, existing)
        .await
        .with_context(|| format!("writing global LSan blacklist {}", path.display()))
}

/// Copies the global blacklist into `local_dir`, dropping `testcase_id`'s
/// own entry (`spec.md` §4.14 step 5).
pub async fn copy_local_excluding(
    root_dir: &Path,
    local_dir: &Path,
    testcase_id: Uuid,
) -> Result<PathBuf> {
    let path = global_path(root_dir);
    let contents = fs::read_to_string(&path).await.unwrap_or_default();
    let own_tag = tag(testcase_id);

    let filtered: String = contents
        .lines()
        .filter(|line| !line.contains(&own_tag))
        .map(|line| format!("{line}\n"))
        .collect();

    fs::create_dir_all(local_dir).await?;
    let local_path = local_dir.join(SUPPRESSIONS_FILE);
    fs::write(&local_path, filtered)
        .await
        .with_context(|| format!("writing local LSan blacklist {}", local_path.display()))?;

    Ok(local_path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_update_and_copy_excludes_own_entry() {
        let root = tempdir().unwrap();
        let a = Uuid::new_v4();
        let b = Uuid::new_v4();

        update_global_blacklist(root.path(), a, "leaky_fn_a")
            .await
            .unwrap();
        update_global_blacklist(root.path(), b, "leaky_fn_b")
            .await
            .unwrap();

        let local = tempdir().unwrap();
        let local_path = copy_local_excluding(root.path(), local.path(), a)
            .await
            .unwrap();
        let contents = std::fs::read_to_string(local_path).unwrap();

        assert!(!contents.contains("leaky_fn_a"));
        assert!(contents.contains("leaky_fn_b"));
    }

    #[tokio::test]
    async fn test_update_is_idempotent() {
        let root = tempdir().unwrap();
        let id = Uuid::new_v4();

        update_global_blacklist(root.path(), id, "leaky_fn")
            .await
            .unwrap();
        update_global_blacklist(root.path(), id, "leaky_fn")
            .await
            .unwrap();

        let contents = std::fs::read_to_string(global_path(root.path())).unwrap();
        assert_eq!(contents.matches("leaky_fn").count(), 1);
    }

    #[tokio::test]
    async fn test_copy_with_no_global_file_is_empty() {
        let root = tempdir().unwrap();
        let local = tempdir().unwrap();
        let local_path = copy_local_excluding(root.path(), local.path(), Uuid::new_v4())
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(local_path).unwrap(), "");
    }
}
