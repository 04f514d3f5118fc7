//! Byte-Stream Source Abstractions
//!
//! Decoders consume encoded audio exclusively through [`ByteSource`]. The host
//! decides where the bytes come from (a file, a socket, a cache entry); the
//! core only needs sequential reads, optional random access, and an optional
//! total length.

use bytes::Bytes;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};

use crate::error::{BridgeError, Result};

/// Source of raw encoded bytes.
///
/// Implementations are owned by a single decoder and moved onto the decode
/// thread, hence the `Send` bound. Reads may block on I/O but must not block
/// indefinitely: a source that cannot make progress should return an error.
///
/// # Example
///
/// ```ignore
/// use bridge_traits::io::{ByteSource, MemorySource};
///
/// let mut source = MemorySource::new(vec![1u8, 2, 3, 4]);
/// let mut buf = [0u8; 2];
/// assert_eq!(source.read(&mut buf)?, 2);
/// assert_eq!(source.length(), Some(4));
/// ```
#[cfg_attr(test, mockall::automock)]
pub trait ByteSource: Send {
    /// Read up to `buf.len()` bytes. Returns `Ok(0)` at end of stream.
    fn read(&mut self, buf: &mut [u8]) -> Result<usize>;

    /// Reposition the stream.
    ///
    /// # Errors
    ///
    /// Returns [`BridgeError::NotSeekable`] for forward-only streams and
    /// [`BridgeError::SeekOutOfRange`] for targets before the start.
    fn seek(&mut self, pos: SeekFrom) -> Result<u64>;

    /// Total size in bytes, if known.
    fn length(&self) -> Option<u64>;

    /// Whether [`seek`](ByteSource::seek) is supported.
    fn is_seekable(&self) -> bool {
        true
    }
}

impl<S: ByteSource + ?Sized> ByteSource for Box<S> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        (**self).read(buf)
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        (**self).seek(pos)
    }

    fn length(&self) -> Option<u64> {
        (**self).length()
    }

    fn is_seekable(&self) -> bool {
        (**self).is_seekable()
    }
}

/// Resolve a [`SeekFrom`] against a current position and an optional length.
fn resolve_seek(pos: SeekFrom, current: u64, length: Option<u64>) -> Result<u64> {
    let target: i128 = match pos {
        SeekFrom::Start(offset) => offset as i128,
        SeekFrom::Current(delta) => current as i128 + delta as i128,
        SeekFrom::End(delta) => match length {
            Some(len) => len as i128 + delta as i128,
            None => {
                return Err(BridgeError::OperationFailed(
                    "cannot seek from end of a source with unknown length".to_string(),
                ))
            }
        },
    };

    if target < 0 {
        return Err(BridgeError::SeekOutOfRange {
            position: target,
            length,
        });
    }

    Ok(target as u64)
}

// ============================================================================
// File Source
// ============================================================================

/// [`ByteSource`] backed by a local file.
#[derive(Debug)]
pub struct FileSource {
    file: File,
    path: PathBuf,
    length: Option<u64>,
}

impl FileSource {
    /// Open a file for reading.
    pub fn open(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::open(&path)?;
        let length = file.metadata().ok().map(|m| m.len());
        Ok(Self { file, path, length })
    }

    /// Path this source was opened from.
    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl ByteSource for FileSource {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.file.read(buf)?)
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        Ok(self.file.seek(pos)?)
    }

    fn length(&self) -> Option<u64> {
        self.length
    }
}

// ============================================================================
// Memory Source
// ============================================================================

/// [`ByteSource`] over an in-memory buffer.
///
/// Cloning the underlying [`Bytes`] is cheap, so the same encoded asset can
/// back several sources.
#[derive(Debug, Clone)]
pub struct MemorySource {
    data: Bytes,
    position: u64,
}

impl MemorySource {
    pub fn new(data: impl Into<Bytes>) -> Self {
        Self {
            data: data.into(),
            position: 0,
        }
    }

    pub fn position(&self) -> u64 {
        self.position
    }
}

impl ByteSource for MemorySource {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let len = self.data.len() as u64;
        if self.position >= len {
            return Ok(0);
        }

        let start = self.position as usize;
        let count = buf.len().min(self.data.len() - start);
        buf[..count].copy_from_slice(&self.data[start..start + count]);
        self.position += count as u64;
        Ok(count)
    }

    fn seek(&mut self, pos: SeekFrom) -> Result<u64> {
        self.position = resolve_seek(pos, self.position, Some(self.data.len() as u64))?;
        Ok(self.position)
    }

    fn length(&self) -> Option<u64> {
        Some(self.data.len() as u64)
    }
}

// ============================================================================
// Forward-only Stream Source
// ============================================================================

/// Forward-only [`ByteSource`] over any reader (pipes, sockets, decoders of
/// an outer container). Seeking always fails with
/// [`BridgeError::NotSeekable`].
pub struct StreamSource<R> {
    reader: R,
}

impl<R: Read + Send> StreamSource<R> {
    pub fn new(reader: R) -> Self {
        Self { reader }
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}

impl<R: Read + Send> ByteSource for StreamSource<R> {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        Ok(self.reader.read(buf)?)
    }

    fn seek(&mut self, _pos: SeekFrom) -> Result<u64> {
        Err(BridgeError::NotSeekable)
    }

    fn length(&self) -> Option<u64> {
        None
    }

    fn is_seekable(&self) -> bool {
        false
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn test_memory_source_reads_sequentially() {
        let mut source = MemorySource::new(vec![1u8, 2, 3, 4, 5]);
        let mut buf = [0u8; 3];

        assert_eq!(source.read(&mut buf).unwrap(), 3);
        assert_eq!(buf, [1, 2, 3]);
        assert_eq!(source.read(&mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], &[4, 5]);
        assert_eq!(source.read(&mut buf).unwrap(), 0);
    }

    #[test]
    fn test_memory_source_seek() {
        let mut source = MemorySource::new(vec![10u8, 20, 30, 40]);

        assert_eq!(source.seek(SeekFrom::End(-1)).unwrap(), 3);
        let mut buf = [0u8; 1];
        source.read(&mut buf).unwrap();
        assert_eq!(buf[0], 40);

        assert_eq!(source.seek(SeekFrom::Start(1)).unwrap(), 1);
        assert_eq!(source.seek(SeekFrom::Current(1)).unwrap(), 2);
        assert!(matches!(
            source.seek(SeekFrom::Current(-5)),
            Err(BridgeError::SeekOutOfRange { .. })
        ));
        assert_eq!(source.length(), Some(4));
    }

    #[test]
    fn test_stream_source_is_forward_only() {
        let mut source = StreamSource::new(Cursor::new(vec![7u8; 16]));
        assert!(!source.is_seekable());
        assert_eq!(source.length(), None);
        assert!(matches!(
            source.seek(SeekFrom::Start(0)),
            Err(BridgeError::NotSeekable)
        ));

        let mut buf = [0u8; 8];
        assert_eq!(source.read(&mut buf).unwrap(), 8);
    }

    #[test]
    fn test_boxed_source_delegates() {
        let mut mock = MockByteSource::new();
        mock.expect_length().return_const(Some(128u64));
        mock.expect_is_seekable().return_const(false);

        let boxed: Box<dyn ByteSource> = Box::new(mock);
        assert_eq!(boxed.length(), Some(128));
        assert!(!boxed.is_seekable());
    }

    #[test]
    fn test_file_source_missing_file() {
        let result = FileSource::open("/definitely/not/here.flac");
        assert!(matches!(result, Err(BridgeError::Io(_))));
    }
}
