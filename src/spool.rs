//! Spill-to-disk buffer for message bodies that exceed
//! `message_body_spool_size` (spec §5.4), with a streaming SHA-512 computed
//! incrementally over whatever's written so integrity checking never
//! requires a second read pass.

use sha2::{Digest, Sha512};
use std::io::SeekFrom;
use tokio::fs::File;
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};

use crate::error::SessionResult;

enum Backing {
    Memory(Vec<u8>),
    Disk { file: File, len: u64 },
}

/// A growable body buffer that starts in memory and spills to a temp file
/// once it crosses the configured threshold. Tracks a running SHA-512 over
/// everything appended so far.
pub struct SpoolBuffer {
    backing: Backing,
    spool_threshold: usize,
    hasher: Sha512,
    spool_dir: Option<std::path::PathBuf>,
    /// Cursor for `read_chunk`'s sequential forward reads. Writing and
    /// chunked reading are never interleaved on the same buffer -- a buffer
    /// is filled completely before anything reads it back a chunk at a
    /// time -- so this doesn't need to track write position separately.
    read_pos: u64,
}

impl SpoolBuffer {
    pub fn new(spool_threshold: usize, spool_dir: Option<std::path::PathBuf>) -> Self {
        Self {
            backing: Backing::Memory(Vec::new()),
            spool_threshold,
            hasher: Sha512::new(),
            spool_dir,
            read_pos: 0,
        }
    }

    pub fn len(&self) -> u64 {
        match &self.backing {
            Backing::Memory(buf) => buf.len() as u64,
            Backing::Disk { len, .. } => *len,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Appends a chunk, spilling to disk first if this write would cross
    /// the threshold.
    pub async fn write(&mut self, chunk: &[u8]) -> SessionResult<()> {
        self.hasher.update(chunk);

        if let Backing::Memory(buf) = &mut self.backing {
            if buf.len() + chunk.len() > self.spool_threshold {
                let mut file = self.open_spool_file().await?;
                file.write_all(buf).await?;
                let len = buf.len() as u64;
                self.backing = Backing::Disk { file, len };
            }
        }

        match &mut self.backing {
            Backing::Memory(buf) => buf.extend_from_slice(chunk),
            Backing::Disk { file, len } => {
                file.write_all(chunk).await?;
                *len += chunk.len() as u64;
            }
        }
        Ok(())
    }

    async fn open_spool_file(&self) -> SessionResult<File> {
        let builder = tempfile::Builder::new().prefix("broadcaster-session-");
        let named = match &self.spool_dir {
            Some(dir) => builder.tempfile_in(dir),
            None => builder.tempfile(),
        }?;
        let (std_file, path) = named.keep().map_err(|e| e.error)?;
        // The tempfile crate deletes on drop by default; `keep` detaches
        // that so the handle we hand to tokio owns the lifetime instead.
        // We immediately reopen through tokio so all I/O afterward is async.
        drop(std_file);
        let file = File::options().read(true).write(true).open(&path).await?;
        Ok(file)
    }

    /// The SHA-512 over every byte written so far. Does not consume the
    /// buffer -- call once writing is complete.
    pub fn running_sha512(&self) -> [u8; 64] {
        self.hasher.clone().finalize().into()
    }

    /// Reads the full body back into memory. Only safe to call for bodies
    /// small enough that the caller actually wants them materialized (e.g.
    /// after decompression has already shrunk things, or for delivery to a
    /// `DeliveryFanout` that wants a contiguous slice).
    pub async fn read_all(&mut self) -> SessionResult<Vec<u8>> {
        match &mut self.backing {
            Backing::Memory(buf) => Ok(buf.clone()),
            Backing::Disk { file, len } => {
                let mut out = Vec::with_capacity(*len as usize);
                file.seek(SeekFrom::Start(0)).await?;
                file.read_to_end(&mut out).await?;
                Ok(out)
            }
        }
    }

    /// Reads up to `max_len` bytes starting from wherever the last
    /// `read_chunk` call left off, or the start of the buffer on the first
    /// call. Returns an empty vec once every byte has been read. Unlike
    /// `read_all`, this never materializes more than one chunk at a time,
    /// so a caller streaming a spooled body out (egress chunking, feeding a
    /// compressor) doesn't have to hold the whole thing in memory.
    pub async fn read_chunk(&mut self, max_len: usize) -> SessionResult<Vec<u8>> {
        match &mut self.backing {
            Backing::Memory(buf) => {
                let start = self.read_pos as usize;
                if start >= buf.len() {
                    return Ok(Vec::new());
                }
                let end = (start + max_len).min(buf.len());
                self.read_pos = end as u64;
                Ok(buf[start..end].to_vec())
            }
            Backing::Disk { file, len } => {
                if self.read_pos >= *len {
                    return Ok(Vec::new());
                }
                file.seek(SeekFrom::Start(self.read_pos)).await?;
                let take = ((*len - self.read_pos) as usize).min(max_len);
                let mut chunk = vec![0u8; take];
                file.read_exact(&mut chunk).await?;
                self.read_pos += take as u64;
                Ok(chunk)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn stays_in_memory_below_threshold() {
        let mut buf = SpoolBuffer::new(1024, None);
        buf.write(b"hello").await.unwrap();
        assert!(matches!(buf.backing, Backing::Memory(_)));
        assert_eq!(buf.len(), 5);
    }

    #[tokio::test]
    async fn spills_to_disk_above_threshold() {
        let mut buf = SpoolBuffer::new(4, None);
        buf.write(b"hello world").await.unwrap();
        assert!(matches!(buf.backing, Backing::Disk { .. }));
        assert_eq!(buf.len(), 11);
        let round_tripped = buf.read_all().await.unwrap();
        assert_eq!(round_tripped, b"hello world");
    }

    #[tokio::test]
    async fn running_hash_matches_whole_input_hash() {
        let mut buf = SpoolBuffer::new(4, None);
        buf.write(b"hello").await.unwrap();
        buf.write(b" world").await.unwrap();
        let expected: [u8; 64] = Sha512::digest(b"hello world").into();
        assert_eq!(buf.running_sha512(), expected);
    }
}
