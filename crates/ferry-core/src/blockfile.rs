//! Block-oriented file access.
//!
//! A [`BlockFile`] exposes a file as a sequence of fixed-size blocks
//! addressed by rank. Outbound files are read block by block from the rule's
//! send path; inbound files are written under the rule's work path with a
//! `.part` suffix and renamed into the recv path once the transfer
//! completes. Seeking by rank is what makes resumption idempotent: block
//! `N` always lives at byte offset `N * block_size`.

use std::path::{Path, PathBuf};

use sha2::{Digest, Sha256};
use tokio::fs::{self, File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt, SeekFrom};

use crate::error::{Error, Result};

/// Suffix of in-flight files under the work path.
pub const PART_SUFFIX: &str = ".part";

/// A file opened for block-wise reading or writing.
#[derive(Debug)]
pub struct BlockFile {
    file: File,
    path: PathBuf,
    block_size: u64,
    len: u64,
    position: u64,
    writable: bool,
}

impl BlockFile {
    /// Open an existing file for reading.
    pub async fn open_read(path: &Path, block_size: u32) -> Result<Self> {
        let file = File::open(path).await?;
        let len = file.metadata().await?.len();
        Ok(Self {
            file,
            path: path.to_path_buf(),
            block_size: u64::from(block_size),
            len,
            position: 0,
            writable: false,
        })
    }

    /// Create the in-flight `.part` file for a fresh inbound transfer,
    /// truncating any leftover from an abandoned attempt.
    pub async fn create_write(work_dir: &Path, filename: &str, block_size: u32) -> Result<Self> {
        fs::create_dir_all(work_dir).await?;
        let path = part_path(work_dir, filename)?;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&path)
            .await?;
        Ok(Self {
            file,
            path,
            block_size: u64::from(block_size),
            len: 0,
            position: 0,
            writable: true,
        })
    }

    /// Reopen the in-flight file of an interrupted inbound transfer,
    /// truncated to exactly `rank` complete blocks. A partially flushed tail
    /// block from the previous attempt is discarded so the resumed stream
    /// continues on a clean boundary.
    pub async fn resume_write(
        work_dir: &Path,
        filename: &str,
        block_size: u32,
        rank: u32,
    ) -> Result<Self> {
        fs::create_dir_all(work_dir).await?;
        let path = part_path(work_dir, filename)?;
        let file = OpenOptions::new()
            .create(true)
            .write(true)
            .open(&path)
            .await?;
        let boundary = u64::from(rank) * u64::from(block_size);
        let on_disk = file.metadata().await?.len();
        let complete = (on_disk / u64::from(block_size)) * u64::from(block_size);
        if complete < boundary {
            return Err(Error::Internal(format!(
                "work file {} too short to resume at rank {rank}",
                path.display()
            )));
        }
        file.set_len(boundary).await?;
        let mut this = Self {
            file,
            path,
            block_size: u64::from(block_size),
            len: boundary,
            position: 0,
            writable: true,
        };
        this.seek_to_rank(rank).await?;
        Ok(this)
    }

    /// Position at the start of block `rank`.
    pub async fn seek_to_rank(&mut self, rank: u32) -> Result<()> {
        let offset = u64::from(rank) * self.block_size;
        self.file.seek(SeekFrom::Start(offset)).await?;
        self.position = offset;
        Ok(())
    }

    /// Read the block at the current position.
    ///
    /// Returns the payload and whether it was the last block of the file.
    pub async fn read_block(&mut self) -> Result<(Vec<u8>, bool)> {
        #[allow(clippy::cast_possible_truncation)]
        let mut buf = vec![0u8; self.block_size as usize];
        let mut filled = 0;
        while filled < buf.len() {
            let n = self.file.read(&mut buf[filled..]).await?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        buf.truncate(filled);
        self.position += filled as u64;
        Ok((buf, self.position >= self.len))
    }

    /// Append one block at the current position.
    pub async fn write_block(&mut self, data: &[u8]) -> Result<()> {
        if !self.writable {
            return Err(Error::Internal("block file opened read-only".into()));
        }
        self.file.write_all(data).await?;
        self.position += data.len() as u64;
        self.len = self.len.max(self.position);
        Ok(())
    }

    /// Flush buffered writes to disk.
    pub async fn flush(&mut self) -> Result<()> {
        self.file.flush().await?;
        self.file.sync_all().await?;
        Ok(())
    }

    /// Number of blocks the file spans at the given block size.
    #[must_use]
    pub fn block_count(&self) -> u64 {
        self.len.div_ceil(self.block_size)
    }

    /// File length in bytes.
    #[must_use]
    pub const fn len(&self) -> u64 {
        self.len
    }

    /// Current path of the underlying file.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Flush, close, and move the finished file into its final place.
    pub async fn rename_to_final(mut self, recv_dir: &Path, filename: &str) -> Result<PathBuf> {
        self.flush().await?;
        let source = self.path.clone();
        drop(self.file);
        fs::create_dir_all(recv_dir).await?;
        let target = resolve_in(recv_dir, filename)?;
        fs::rename(&source, &target).await?;
        tracing::debug!(from = %source.display(), to = %target.display(), "Finalized file");
        Ok(target)
    }

    /// SHA-256 over the whole file, hex-encoded. Used by the end-of-transfer
    /// handshake when the mode requests a global check.
    pub async fn sha256_hex(&self) -> Result<String> {
        let mut file = File::open(&self.path).await?;
        let mut hasher = Sha256::new();
        let mut buf = vec![0u8; 64 * 1024];
        loop {
            let n = file.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            hasher.update(&buf[..n]);
        }
        let digest = hasher.finalize();
        Ok(digest.iter().map(|b| format!("{b:02x}")).collect())
    }
}

/// Join `filename` under `base`, refusing components that would escape it.
pub fn resolve_in(base: &Path, filename: &str) -> Result<PathBuf> {
    let relative = Path::new(filename);
    if relative.is_absolute() {
        return Err(Error::InvalidPath(filename.to_string()));
    }
    for component in relative.components() {
        match component {
            std::path::Component::Normal(_) => {}
            _ => return Err(Error::InvalidPath(filename.to_string())),
        }
    }
    Ok(base.join(relative))
}

fn part_path(work_dir: &Path, filename: &str) -> Result<PathBuf> {
    let base_name = Path::new(filename)
        .file_name()
        .and_then(|n| n.to_str())
        .ok_or_else(|| Error::InvalidPath(filename.to_string()))?;
    resolve_in(work_dir, &format!("{base_name}{PART_SUFFIX}"))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_read_blocks_with_short_tail() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("source.bin");
        fs::write(&path, vec![7u8; 1000]).await.unwrap();

        let mut file = BlockFile::open_read(&path, 400).await.unwrap();
        assert_eq!(file.block_count(), 3);

        let (b0, last) = file.read_block().await.unwrap();
        assert_eq!(b0.len(), 400);
        assert!(!last);
        let (_, last) = file.read_block().await.unwrap();
        assert!(!last);
        let (b2, last) = file.read_block().await.unwrap();
        assert_eq!(b2.len(), 200);
        assert!(last);
    }

    #[tokio::test]
    async fn test_exact_multiple_ends_on_full_block() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("source.bin");
        fs::write(&path, vec![1u8; 800]).await.unwrap();

        let mut file = BlockFile::open_read(&path, 400).await.unwrap();
        let (_, last) = file.read_block().await.unwrap();
        assert!(!last);
        let (b1, last) = file.read_block().await.unwrap();
        assert_eq!(b1.len(), 400);
        assert!(last);
    }

    #[tokio::test]
    async fn test_write_then_finalize() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        let recv = dir.path().join("recv");

        let mut file = BlockFile::create_write(&work, "out.bin", 4).await.unwrap();
        file.write_block(&[1, 2, 3, 4]).await.unwrap();
        file.write_block(&[5, 6]).await.unwrap();
        let target = file.rename_to_final(&recv, "out.bin").await.unwrap();

        assert_eq!(fs::read(&target).await.unwrap(), vec![1, 2, 3, 4, 5, 6]);
        assert!(!work.join("out.bin.part").exists());
    }

    #[tokio::test]
    async fn test_resume_truncates_partial_tail_block() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");
        fs::create_dir_all(&work).await.unwrap();
        // two complete blocks of 4 plus a 2-byte partial tail
        fs::write(work.join("f.bin.part"), [1, 1, 1, 1, 2, 2, 2, 2, 9, 9])
            .await
            .unwrap();

        let mut file = BlockFile::resume_write(&work, "f.bin", 4, 2).await.unwrap();
        file.write_block(&[3, 3, 3, 3]).await.unwrap();
        file.flush().await.unwrap();

        let contents = fs::read(work.join("f.bin.part")).await.unwrap();
        assert_eq!(contents, vec![1, 1, 1, 1, 2, 2, 2, 2, 3, 3, 3, 3]);
    }

    #[tokio::test]
    async fn test_seek_to_rank_rewrites_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let work = dir.path().join("work");

        let mut file = BlockFile::create_write(&work, "f.bin", 4).await.unwrap();
        file.write_block(&[1; 4]).await.unwrap();
        file.write_block(&[2; 4]).await.unwrap();
        file.seek_to_rank(1).await.unwrap();
        file.write_block(&[9; 4]).await.unwrap();
        file.flush().await.unwrap();

        let contents = fs::read(work.join("f.bin.part")).await.unwrap();
        assert_eq!(contents, vec![1, 1, 1, 1, 9, 9, 9, 9]);
    }

    #[tokio::test]
    async fn test_sha256_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("source.bin");
        fs::write(&path, b"ferry").await.unwrap();

        let file = BlockFile::open_read(&path, 16).await.unwrap();
        let a = file.sha256_hex().await.unwrap();
        let b = file.sha256_hex().await.unwrap();
        assert_eq!(a, b);
        assert_eq!(a.len(), 64);
    }

    #[test]
    fn test_resolve_in_rejects_traversal() {
        let base = Path::new("/srv/ferry/in");
        assert!(resolve_in(base, "ok.bin").is_ok());
        assert!(resolve_in(base, "sub/ok.bin").is_ok());
        assert!(resolve_in(base, "../escape.bin").is_err());
        assert!(resolve_in(base, "/etc/passwd").is_err());
    }
}
