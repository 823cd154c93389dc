use std::future::Future;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::TransferError;
use crate::types::Fingerprint;

/// Most bytes [`MemorySource::from_reader`] reserves up front.
const READER_PREALLOC_LIMIT: u64 = 8 * 1024 * 1024;

/// Future returned by [`UploadSource::read_range`].
pub type ReadFuture<'a> = Pin<Box<dyn Future<Output = Result<Vec<u8>, TransferError>> + Send + 'a>>;

/// Random-access payload of known size.
///
/// Workers read disjoint ranges concurrently, so implementations must
/// tolerate overlapping calls.
pub trait UploadSource: Send + Sync {
    /// Identity used to validate checkpoints on resume.
    fn fingerprint(&self) -> Fingerprint;

    /// Total payload size in bytes.
    fn size(&self) -> u64;

    /// Reads exactly the bytes in `start..end`.
    fn read_range(&self, start: u64, end: u64) -> ReadFuture<'_>;
}

fn check_range(start: u64, end: u64, size: u64) -> Result<(), TransferError> {
    if start > end || end > size {
        return Err(TransferError::OutOfRange { start, end, size });
    }
    Ok(())
}

// ---------------------------------------------------------------------------
// FileSource
// ---------------------------------------------------------------------------

/// A local file read with positional reads off the async runtime.
#[derive(Debug, Clone)]
pub struct FileSource {
    path: PathBuf,
    fingerprint: Fingerprint,
}

impl FileSource {
    /// Captures the file's fingerprint from its current metadata.
    pub async fn open(path: impl AsRef<Path>) -> Result<Self, TransferError> {
        let path = path.as_ref().to_path_buf();
        let meta = tokio::fs::metadata(&path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let modified: DateTime<Utc> = meta.modified()?.into();
        Ok(Self {
            fingerprint: Fingerprint::new(name, meta.len(), modified),
            path,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl UploadSource for FileSource {
    fn fingerprint(&self) -> Fingerprint {
        self.fingerprint.clone()
    }

    fn size(&self) -> u64 {
        self.fingerprint.size
    }

    fn read_range(&self, start: u64, end: u64) -> ReadFuture<'_> {
        Box::pin(async move {
            check_range(start, end, self.size())?;
            let path = self.path.clone();
            tokio::task::spawn_blocking(move || read_file_range(&path, start, end))
                .await
                .map_err(|e| TransferError::Io(std::io::Error::other(e)))?
        })
    }
}

fn read_file_range(path: &Path, start: u64, end: u64) -> Result<Vec<u8>, TransferError> {
    let mut file = std::fs::File::open(path)?;
    file.seek(SeekFrom::Start(start))?;
    let expected = (end - start) as usize;
    let mut buf = vec![0u8; expected];
    let mut filled = 0;
    while filled < expected {
        let n = file.read(&mut buf[filled..])?;
        if n == 0 {
            return Err(TransferError::ShortRead {
                offset: start,
                expected,
                got: filled,
            });
        }
        filled += n;
    }
    Ok(buf)
}

// ---------------------------------------------------------------------------
// MemorySource
// ---------------------------------------------------------------------------

/// A payload held in memory.
#[derive(Debug, Clone)]
pub struct MemorySource {
    data: Arc<[u8]>,
    fingerprint: Fingerprint,
}

impl MemorySource {
    /// Wraps `data`; the fingerprint's modification time is "now".
    pub fn new(name: impl Into<String>, data: impl Into<Arc<[u8]>>) -> Self {
        let data = data.into();
        Self {
            fingerprint: Fingerprint::new(name, data.len() as u64, Utc::now()),
            data,
        }
    }

    /// Overrides the modification time, so a re-submitted payload can match
    /// an earlier checkpoint.
    pub fn with_modified(mut self, modified: DateTime<Utc>) -> Self {
        self.fingerprint.modified = modified;
        self
    }

    /// Buffers exactly `size` bytes from `reader`.
    pub async fn from_reader<R>(
        name: impl Into<String>,
        mut reader: R,
        size: u64,
    ) -> Result<Self, TransferError>
    where
        R: AsyncRead + Unpin,
    {
        // The declared size is untrusted; `take` bounds the read itself.
        let mut buf = Vec::with_capacity(size.min(READER_PREALLOC_LIMIT) as usize);
        let got = (&mut reader).take(size).read_to_end(&mut buf).await?;
        if (got as u64) < size {
            return Err(TransferError::ShortRead {
                offset: 0,
                expected: usize::try_from(size).unwrap_or(usize::MAX),
                got,
            });
        }
        Ok(Self::new(name, buf))
    }
}

impl UploadSource for MemorySource {
    fn fingerprint(&self) -> Fingerprint {
        self.fingerprint.clone()
    }

    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_range(&self, start: u64, end: u64) -> ReadFuture<'_> {
        Box::pin(async move {
            check_range(start, end, self.size())?;
            Ok(self.data[start as usize..end as usize].to_vec())
        })
    }
}
