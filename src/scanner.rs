use std::{
    os::unix::fs::MetadataExt,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result};
use data_model::{content_hash, FileMetadata};
use sha2::{Digest, Sha256};
use tokio::{fs, io::AsyncReadExt, sync::mpsc};
use tracing::{info, warn};

/// One-capacity handoff between the scanner and the pipeline: the walk
/// blocks after each record until the consumer has taken it.
pub const SCAN_CHANNEL_CAPACITY: usize = 1;

const HASH_CHUNK_SIZE: usize = 64 * 1024;

const NANOS_PER_SEC: i64 = 1_000_000_000;

#[derive(Debug, Default, Clone, Copy)]
pub struct ScanSummary {
    /// Records handed to the consumer.
    pub emitted: u64,
    /// Files that could not be read and produced no record.
    pub skipped: u64,
}

/// Streams the file through SHA-256 and renders the namespaced fingerprint.
/// A read failure discards any partial digest.
pub async fn fingerprint_file(path: &Path) -> Result<String> {
    let mut file = fs::File::open(path)
        .await
        .with_context(|| format!("opening {} for hashing", path.display()))?;
    let mut hasher = Sha256::new();
    let mut buf = vec![0u8; HASH_CHUNK_SIZE];
    loop {
        let n = file
            .read(&mut buf)
            .await
            .with_context(|| format!("reading {} for hashing", path.display()))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(content_hash(hasher))
}

/// Walks the tree rooted at `root`, emitting one record per regular file
/// into `tx` in lexical per-directory, depth-first order.
///
/// Symlinks are followed for content but never descended as directories,
/// so a link back into the tree cannot create a cycle. A file that cannot
/// be statted or hashed is skipped and counted; an unreadable directory
/// aborts the whole walk. Dropping the sender at return is the consumer's
/// sole completion signal.
pub async fn scan_tree(root: &Path, tx: mpsc::Sender<FileMetadata>) -> Result<ScanSummary> {
    let mut summary = ScanSummary::default();
    let mut pending = vec![root.to_path_buf()];
    while let Some(dir) = pending.pop() {
        let Some(subdirs) = scan_directory(&dir, &tx, &mut summary).await? else {
            // Consumer went away; the directories still pending have no
            // audience.
            break;
        };
        // pending is a stack: push in reverse so siblings come out in
        // lexical order.
        for sub in subdirs.into_iter().rev() {
            pending.push(sub);
        }
    }
    info!(
        emitted = summary.emitted,
        skipped = summary.skipped,
        "scan completed"
    );
    Ok(summary)
}

/// Scans a single directory. Returns the subdirectories to descend, or
/// `None` once the consumer has dropped the receiver.
async fn scan_directory(
    dir: &Path,
    tx: &mpsc::Sender<FileMetadata>,
    summary: &mut ScanSummary,
) -> Result<Option<Vec<PathBuf>>> {
    let mut read_dir = fs::read_dir(dir)
        .await
        .with_context(|| format!("walking directory {}", dir.display()))?;
    let mut entries = Vec::new();
    while let Some(entry) = read_dir
        .next_entry()
        .await
        .with_context(|| format!("walking directory {}", dir.display()))?
    {
        entries.push(entry.path());
    }
    entries.sort();

    let mut subdirs = Vec::new();
    for path in entries {
        // lstat for the descend decision: a symlinked directory is a file
        // candidate, never a subtree, so a link back into the tree cannot
        // loop the walk.
        let entry_type = match fs::symlink_metadata(&path).await {
            Ok(metadata) => metadata.file_type(),
            Err(e) => {
                warn!("skipping {}: {}", path.display(), e);
                summary.skipped += 1;
                continue;
            }
        };
        if entry_type.is_dir() {
            subdirs.push(path);
            continue;
        }
        if !entry_type.is_file() && !entry_type.is_symlink() {
            // Sockets, FIFOs, devices.
            continue;
        }
        // Content and stat fields come from the link target; a target that
        // is missing or not a regular file is a per-file skip.
        let metadata = match fs::metadata(&path).await {
            Ok(metadata) => metadata,
            Err(e) => {
                warn!("skipping {}: {}", path.display(), e);
                summary.skipped += 1;
                continue;
            }
        };
        if !metadata.is_file() {
            warn!("skipping {}: not a regular file", path.display());
            summary.skipped += 1;
            continue;
        }
        let hash = match fingerprint_file(&path).await {
            Ok(hash) => hash,
            Err(e) => {
                warn!("skipping {}: {:#}", path.display(), e);
                summary.skipped += 1;
                continue;
            }
        };
        let record = FileMetadata {
            name: path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default(),
            path: path.to_string_lossy().into_owned(),
            ctime: metadata.ctime() * NANOS_PER_SEC + metadata.ctime_nsec(),
            mtime: metadata.mtime() * NANOS_PER_SEC + metadata.mtime_nsec(),
            atime: metadata.atime() * NANOS_PER_SEC + metadata.atime_nsec(),
            uid: metadata.uid(),
            gid: metadata.gid(),
            size: metadata.size(),
            hash,
        };
        if tx.send(record).await.is_err() {
            return Ok(None);
        }
        summary.emitted += 1;
    }
    Ok(Some(subdirs))
}

#[cfg(test)]
mod tests {
    use std::os::unix::fs::symlink;

    use super::*;

    const HELLO_HASH: &str =
        "sha256:2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    async fn collect_records(root: &Path) -> Result<(Vec<FileMetadata>, ScanSummary)> {
        let (tx, mut rx) = mpsc::channel(SCAN_CHANNEL_CAPACITY);
        let root = root.to_path_buf();
        let scan = tokio::spawn(async move { scan_tree(&root, tx).await });
        let mut records = Vec::new();
        while let Some(record) = rx.recv().await {
            records.push(record);
        }
        let summary = scan.await??;
        Ok((records, summary))
    }

    #[tokio::test]
    async fn test_fingerprint_known_vector() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let path = temp_dir.path().join("a.txt");
        std::fs::write(&path, "hello")?;
        assert_eq!(fingerprint_file(&path).await?, HELLO_HASH);
        Ok(())
    }

    #[tokio::test]
    async fn test_fingerprint_depends_on_content_only() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        std::fs::create_dir(temp_dir.path().join("deep"))?;
        let first = temp_dir.path().join("one.bin");
        let second = temp_dir.path().join("deep/two.bin");
        std::fs::write(&first, "identical bytes")?;
        std::fs::write(&second, "identical bytes")?;
        assert_eq!(
            fingerprint_file(&first).await?,
            fingerprint_file(&second).await?
        );
        Ok(())
    }

    #[tokio::test]
    async fn test_fingerprint_changes_on_single_byte_mutation() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let path = temp_dir.path().join("a.bin");
        let mut content = vec![0u8; 4096];
        std::fs::write(&path, &content)?;
        let before = fingerprint_file(&path).await?;
        content[2048] ^= 1;
        std::fs::write(&path, &content)?;
        let after = fingerprint_file(&path).await?;
        assert_ne!(before, after);
        Ok(())
    }

    #[tokio::test]
    async fn test_fingerprint_unreadable_file_is_an_error() {
        let result = fingerprint_file(Path::new("/nonexistent/nope.txt")).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_scan_emits_one_record_per_regular_file() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        std::fs::write(temp_dir.path().join("a.txt"), "hello")?;
        std::fs::write(temp_dir.path().join("b.txt"), "world!")?;
        std::fs::create_dir_all(temp_dir.path().join("nested/deeper"))?;
        std::fs::write(temp_dir.path().join("nested/c.txt"), "ccc")?;
        std::fs::write(temp_dir.path().join("nested/deeper/d.txt"), "dddd")?;

        let (records, summary) = collect_records(temp_dir.path()).await?;
        assert_eq!(records.len(), 4);
        assert_eq!(summary.emitted, 4);
        assert_eq!(summary.skipped, 0);

        for record in &records {
            assert!(!record.hash.is_empty());
            assert!(!record.name.is_empty());
            assert!(record.hash.starts_with("sha256:"));
            assert_eq!(
                record.size,
                std::fs::metadata(&record.path)?.len(),
                "size mismatch for {}",
                record.path
            );
        }

        let a = records.iter().find(|r| r.name == "a.txt").unwrap();
        assert_eq!(a.hash, HELLO_HASH);
        assert_eq!(a.size, 5);
        Ok(())
    }

    #[tokio::test]
    async fn test_scan_empty_tree_emits_nothing() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        let (records, summary) = collect_records(temp_dir.path()).await?;
        assert!(records.is_empty());
        assert_eq!(summary.emitted, 0);
        assert_eq!(summary.skipped, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_unreadable_file_is_skipped_and_counted() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        std::fs::write(temp_dir.path().join("a.txt"), "hello")?;
        // A dangling symlink fails the stat-and-hash step the way an
        // unreadable file does, without aborting the walk.
        symlink(
            temp_dir.path().join("missing-target"),
            temp_dir.path().join("broken-link"),
        )?;
        std::fs::write(temp_dir.path().join("z.txt"), "still here")?;

        let (records, summary) = collect_records(temp_dir.path()).await?;
        assert_eq!(records.len(), 2);
        assert_eq!(summary.emitted, 2);
        assert_eq!(summary.skipped, 1);
        assert!(records.iter().any(|r| r.name == "z.txt"));
        Ok(())
    }

    #[tokio::test]
    async fn test_symlink_cycle_does_not_loop_the_walk() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        std::fs::write(temp_dir.path().join("a.txt"), "hello")?;
        // A link back to the root would revisit the tree forever if the
        // walk descended it.
        symlink(temp_dir.path(), temp_dir.path().join("loop"))?;

        let (records, summary) = collect_records(temp_dir.path()).await?;
        assert_eq!(records.len(), 1, "duplicate records emitted");
        assert_eq!(records[0].name, "a.txt");
        assert_eq!(summary.emitted, 1);
        assert_eq!(summary.skipped, 1);
        Ok(())
    }

    #[tokio::test]
    async fn test_symlink_to_file_is_ingested_by_target_content() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        std::fs::write(temp_dir.path().join("target.txt"), "hello")?;
        symlink(
            temp_dir.path().join("target.txt"),
            temp_dir.path().join("link.txt"),
        )?;

        let (records, summary) = collect_records(temp_dir.path()).await?;
        assert_eq!(records.len(), 2);
        assert_eq!(summary.skipped, 0);
        assert!(records.iter().all(|r| r.hash == HELLO_HASH));
        assert!(records.iter().any(|r| r.name == "link.txt"));
        Ok(())
    }

    #[tokio::test]
    async fn test_walk_stops_once_consumer_departs() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        std::fs::create_dir(temp_dir.path().join("d1"))?;
        std::fs::create_dir(temp_dir.path().join("d2"))?;
        std::fs::write(temp_dir.path().join("d1/a.txt"), "hello")?;
        std::fs::write(temp_dir.path().join("d1/b.txt"), "more")?;
        std::fs::write(temp_dir.path().join("d1/c.txt"), "even more")?;
        // Visiting d2 after the receiver is gone would count this skip.
        symlink(
            temp_dir.path().join("d2/missing-target"),
            temp_dir.path().join("d2/broken-link"),
        )?;

        let (tx, mut rx) = mpsc::channel(SCAN_CHANNEL_CAPACITY);
        let root = temp_dir.path().to_path_buf();
        let scan = tokio::spawn(async move { scan_tree(&root, tx).await });

        let first = rx.recv().await.unwrap();
        assert_eq!(first.name, "a.txt");
        // With the receiver gone a send fails inside d1, before d2 is
        // ever reached.
        drop(rx);

        let summary = scan.await??;
        assert!(summary.emitted < 3);
        assert_eq!(summary.skipped, 0);
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_root_aborts_the_walk() {
        let (tx, _rx) = mpsc::channel(SCAN_CHANNEL_CAPACITY);
        let result = scan_tree(Path::new("/nonexistent/tree"), tx).await;
        assert!(result.is_err());
    }

    #[tokio::test]
    async fn test_records_carry_inode_metadata() -> Result<()> {
        let temp_dir = tempfile::tempdir()?;
        std::fs::write(temp_dir.path().join("a.txt"), "hello")?;

        let (records, _) = collect_records(temp_dir.path()).await?;
        let record = &records[0];
        let metadata = std::fs::metadata(&record.path)?;
        assert_eq!(record.uid, metadata.uid());
        assert_eq!(record.gid, metadata.gid());
        assert_eq!(
            record.mtime,
            metadata.mtime() * NANOS_PER_SEC + metadata.mtime_nsec()
        );
        assert!(record.mtime > 0);
        Ok(())
    }
}
