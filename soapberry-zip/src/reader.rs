//! Hardened archive reader.
//!
//! [`SecureZipReader`] is built over one of two source kinds:
//!
//! - a seekable source, read through its central directory with random access
//! - a forward-only stream, walked through its local file headers
//!
//! Streamed entries cannot be revisited, so they are inflated once at open
//! time (subject to the same limits) and served from memory afterwards. A file
//! whose central directory cannot be parsed is retried as a stream.

use crate::errors::{Error, Result};
use crate::limits::ZipLimits;
use crate::threshold::ThresholdReader;
use log::warn;
use std::collections::HashMap;
use std::fs::File;
use std::io::{BufReader, Cursor, Read, Seek};
use std::path::{Path, PathBuf};
use zip::ZipArchive;

const LOCAL_HEADER_SIGNATURE: [u8; 4] = *b"PK\x03\x04";
const END_OF_CENTRAL_DIRECTORY_SIGNATURE: [u8; 4] = *b"PK\x05\x06";

/// Object-safe `Read + Seek` for boxed archive sources.
pub trait ReadSeek: Read + Seek + Send {}

impl<T: Read + Seek + Send> ReadSeek for T {}

/// How the reader reaches its entries.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SourceKind {
    /// Central directory with random access.
    Seekable,
    /// Sequential local-header walk, entries buffered at open.
    Sequential,
}

/// Header metadata of one archive entry.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EntryInfo {
    name: String,
    size: u64,
    compressed_size: u64,
    is_dir: bool,
}

impl EntryInfo {
    /// Entry name as stored in the archive.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Declared inflated size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Declared compressed size in bytes, `0` if the header did not record it.
    pub fn compressed_size(&self) -> u64 {
        self.compressed_size
    }

    pub fn is_dir(&self) -> bool {
        self.is_dir
    }
}

enum Source {
    Seekable(ZipArchive<Box<dyn ReadSeek>>),
    Sequential(HashMap<String, Vec<u8>>),
}

enum ReaderState {
    Reading(Source),
    Closed,
}

/// ZIP reader that refuses to inflate entries beyond its [`ZipLimits`].
///
/// Construction performs the open step; the reader is then in the reading
/// state until [`close`](Self::close) releases the underlying source.
pub struct SecureZipReader {
    state: ReaderState,
    kind: SourceKind,
    entries: Vec<EntryInfo>,
    index: HashMap<String, usize>,
    limits: ZipLimits,
    inflated_total: u64,
    path: Option<PathBuf>,
}

impl SecureZipReader {
    /// Open an archive file, retrying as a stream if its central directory is unreadable.
    pub fn open_file(path: impl AsRef<Path>, limits: ZipLimits) -> Result<Self> {
        Self::open_file_inner(path.as_ref(), limits, true)
    }

    /// Open an archive file through its central directory only.
    pub fn open_file_strict(path: impl AsRef<Path>, limits: ZipLimits) -> Result<Self> {
        Self::open_file_inner(path.as_ref(), limits, false)
    }

    fn open_file_inner(path: &Path, limits: ZipLimits, fallback: bool) -> Result<Self> {
        let file = File::open(path)
            .map_err(|e| Error::io(format!("opening {}", path.display()), e))?;
        let source: Box<dyn ReadSeek> = Box::new(BufReader::new(file));

        // The handle is dropped with the failed archive before any retry.
        let mut reader = match ZipArchive::new(source) {
            Ok(archive) => Self::from_archive(archive, limits)?,
            Err(err) if fallback => {
                warn!(
                    "central directory of {} is unreadable ({}); falling back to sequential stream processing",
                    path.display(),
                    err
                );
                let file = File::open(path)
                    .map_err(|e| Error::io(format!("reopening {}", path.display()), e))?;
                Self::from_stream(BufReader::new(file), limits)?
            },
            Err(err) => return Err(Error::from_archive_open(err)),
        };
        reader.path = Some(path.to_path_buf());
        Ok(reader)
    }

    /// Read an archive held in memory.
    pub fn from_bytes(data: Vec<u8>, limits: ZipLimits) -> Result<Self> {
        Self::from_seekable(Cursor::new(data), limits)
    }

    /// Read an archive from any seekable source.
    pub fn from_seekable<R: Read + Seek + Send + 'static>(reader: R, limits: ZipLimits) -> Result<Self> {
        let source: Box<dyn ReadSeek> = Box::new(reader);
        let archive = ZipArchive::new(source).map_err(Error::from_archive_open)?;
        Self::from_archive(archive, limits)
    }

    fn from_archive(mut archive: ZipArchive<Box<dyn ReadSeek>>, limits: ZipLimits) -> Result<Self> {
        let mut entries = Vec::with_capacity(archive.len());
        for i in 0..archive.len() {
            let file = archive.by_index_raw(i)?;
            let info = EntryInfo {
                name: file.name().to_string(),
                size: file.size(),
                compressed_size: file.compressed_size(),
                is_dir: file.is_dir(),
            };
            limits.check_declared(&info.name, info.compressed_size, info.size)?;
            entries.push(info);
        }

        Ok(Self::assemble(
            Source::Seekable(archive),
            SourceKind::Seekable,
            entries,
            limits,
            0,
        ))
    }

    /// Read an archive from a forward-only stream.
    ///
    /// Every entry is inflated here, under the limits, because a stream cannot
    /// be rewound to fetch it later.
    ///
    /// Entry sizes are taken from the local headers, so archives whose entries
    /// carry their sizes in a trailing data descriptor (general purpose flag
    /// bit 3, as written by streaming producers) fail with [`Error::Zip`].
    /// Read those through [`from_bytes`](Self::from_bytes) or
    /// [`from_seekable`](Self::from_seekable) instead.
    pub fn from_stream<R: Read>(mut reader: R, limits: ZipLimits) -> Result<Self> {
        let mut signature = [0u8; 4];
        if let Err(e) = reader.read_exact(&mut signature) {
            return Err(match e.kind() {
                std::io::ErrorKind::UnexpectedEof => {
                    Error::NotZip("input is shorter than a ZIP header".to_string())
                },
                _ => Error::io("reading ZIP signature", e),
            });
        }

        if signature == END_OF_CENTRAL_DIRECTORY_SIGNATURE {
            return Ok(Self::assemble(
                Source::Sequential(HashMap::new()),
                SourceKind::Sequential,
                Vec::new(),
                limits,
                0,
            ));
        }
        if signature != LOCAL_HEADER_SIGNATURE {
            return Err(Error::NotZip("missing local file header signature".to_string()));
        }

        let mut stream = Cursor::new(signature).chain(reader);
        let mut entries = Vec::new();
        let mut contents = HashMap::new();
        let mut inflated_total = 0u64;

        loop {
            let next = zip::read::read_zipfile_from_stream(&mut stream)?;
            let Some(mut file) = next else {
                break;
            };

            let info = EntryInfo {
                name: file.name().to_string(),
                size: file.size(),
                compressed_size: file.compressed_size(),
                is_dir: file.is_dir(),
            };
            limits.check_declared(&info.name, info.compressed_size, info.size)?;

            let data = ThresholdReader::new(&mut file, info.name.as_str(), info.compressed_size, limits)
                .read_to_vec(info.size)?;
            inflated_total += data.len() as u64;

            if !info.is_dir {
                contents.insert(info.name.clone(), data);
            }
            entries.push(info);
        }

        Ok(Self::assemble(
            Source::Sequential(contents),
            SourceKind::Sequential,
            entries,
            limits,
            inflated_total,
        ))
    }

    fn assemble(
        source: Source,
        kind: SourceKind,
        entries: Vec<EntryInfo>,
        limits: ZipLimits,
        inflated_total: u64,
    ) -> Self {
        let index = entries
            .iter()
            .enumerate()
            .map(|(i, e)| (e.name.clone(), i))
            .collect();
        Self {
            state: ReaderState::Reading(source),
            kind,
            entries,
            index,
            limits,
            inflated_total,
            path: None,
        }
    }

    /// All entries in archive order, directories included.
    pub fn entries(&self) -> &[EntryInfo] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Look up an entry by its exact name.
    pub fn entry(&self, name: &str) -> Option<&EntryInfo> {
        self.index.get(name).map(|&i| &self.entries[i])
    }

    /// Look up an entry ignoring ASCII case.
    pub fn entry_ignore_case(&self, name: &str) -> Option<&EntryInfo> {
        self.entry(name).or_else(|| {
            self.entries
                .iter()
                .find(|e| e.name.eq_ignore_ascii_case(name))
        })
    }

    pub fn contains(&self, name: &str) -> bool {
        self.index.contains_key(name)
    }

    /// Inflate an entry into memory, enforcing the limits as it streams.
    pub fn read(&mut self, name: &str) -> Result<Vec<u8>> {
        let info = self
            .entry(name)
            .cloned()
            .ok_or_else(|| Error::EntryNotFound(name.to_string()))?;

        let data = match &mut self.state {
            ReaderState::Closed => return Err(Error::Closed),
            ReaderState::Reading(Source::Sequential(contents)) => {
                return contents
                    .get(name)
                    .cloned()
                    .ok_or_else(|| Error::EntryNotFound(name.to_string()));
            },
            ReaderState::Reading(Source::Seekable(archive)) => {
                let mut file = archive.by_name(name)?;
                ThresholdReader::new(&mut file, name, info.compressed_size, self.limits)
                    .read_to_vec(info.size)?
            },
        };

        self.inflated_total += data.len() as u64;
        Ok(data)
    }

    /// Total bytes inflated through this reader so far.
    ///
    /// Consumers enforcing [`ZipLimits::max_text_size`] budget against this.
    pub fn inflated_total(&self) -> u64 {
        self.inflated_total
    }

    pub fn limits(&self) -> &ZipLimits {
        &self.limits
    }

    pub fn source_kind(&self) -> SourceKind {
        self.kind
    }

    /// The file this reader was opened from, if any.
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn is_closed(&self) -> bool {
        matches!(self.state, ReaderState::Closed)
    }

    /// Release the underlying source. Further reads fail with [`Error::Closed`].
    pub fn close(&mut self) {
        self.state = ReaderState::Closed;
    }

    /// Reopen a closed reader from the file it was opened from.
    ///
    /// Readers built from bytes or streams have nothing to reopen and stay
    /// closed, returning [`Error::Closed`].
    pub fn reopen(&mut self) -> Result<()> {
        if !self.is_closed() {
            return Ok(());
        }
        let Some(path) = self.path.clone() else {
            return Err(Error::Closed);
        };
        let fresh = Self::open_file_inner(&path, self.limits, self.kind == SourceKind::Sequential)?;
        self.state = fresh.state;
        Ok(())
    }
}

impl std::fmt::Debug for SecureZipReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecureZipReader")
            .field("kind", &self.kind)
            .field("entries", &self.entries.len())
            .field("closed", &self.is_closed())
            .field("path", &self.path)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::writer::{EntrySink, StreamingArchiveWriter};
    use std::io::Write;

    fn sample_archive() -> Vec<u8> {
        let mut writer = StreamingArchiveWriter::new();
        writer.write_deflated("[Content_Types].xml", b"<Types/>").unwrap();
        writer.write_deflated("word/document.xml", b"<w:document/>").unwrap();
        writer.write_stored("media/image1.png", b"\x89PNG....").unwrap();
        writer.finish_to_bytes().unwrap()
    }

    fn zeros_archive(len: usize) -> Vec<u8> {
        let mut writer = StreamingArchiveWriter::new();
        writer.write_deflated("zeros.bin", &vec![0u8; len]).unwrap();
        writer.finish_to_bytes().unwrap()
    }

    #[test]
    fn test_seekable_read() {
        let mut reader = SecureZipReader::from_bytes(sample_archive(), ZipLimits::default()).unwrap();
        assert_eq!(reader.source_kind(), SourceKind::Seekable);
        assert_eq!(reader.len(), 3);
        assert_eq!(reader.read("word/document.xml").unwrap(), b"<w:document/>");
        assert_eq!(reader.inflated_total(), 13);
        assert!(reader.entry_ignore_case("[content_types].XML").is_some());
    }

    #[test]
    fn test_stream_read() {
        let data = sample_archive();
        let mut reader = SecureZipReader::from_stream(&data[..], ZipLimits::default()).unwrap();
        assert_eq!(reader.source_kind(), SourceKind::Sequential);
        assert_eq!(reader.len(), 3);
        assert_eq!(reader.read("media/image1.png").unwrap(), b"\x89PNG....");
        assert_eq!(reader.inflated_total(), 8 + 13 + 8);
    }

    #[test]
    fn test_not_a_zip() {
        let err = SecureZipReader::from_bytes(b"hello world, not an archive".to_vec(), ZipLimits::default())
            .unwrap_err();
        assert!(matches!(err, Error::NotZip(_)), "{err}");

        let err = SecureZipReader::from_stream(&b"plain text"[..], ZipLimits::default()).unwrap_err();
        assert!(matches!(err, Error::NotZip(_)), "{err}");

        let err = SecureZipReader::from_stream(&b""[..], ZipLimits::default()).unwrap_err();
        assert!(matches!(err, Error::NotZip(_)), "{err}");
    }

    #[test]
    fn test_empty_archive_is_not_an_error() {
        let data = StreamingArchiveWriter::new().finish_to_bytes().unwrap();
        let reader = SecureZipReader::from_bytes(data.clone(), ZipLimits::default()).unwrap();
        assert!(reader.is_empty());
        let reader = SecureZipReader::from_stream(&data[..], ZipLimits::default()).unwrap();
        assert!(reader.is_empty());
    }

    #[test]
    fn test_ratio_bomb_rejected_at_open() {
        let err = SecureZipReader::from_bytes(zeros_archive(2 * 1024 * 1024), ZipLimits::default())
            .unwrap_err();
        assert!(matches!(err, Error::ZipBomb { .. }), "{err}");

        let data = zeros_archive(2 * 1024 * 1024);
        let err = SecureZipReader::from_stream(&data[..], ZipLimits::default()).unwrap_err();
        assert!(matches!(err, Error::ZipBomb { .. }), "{err}");
    }

    #[test]
    fn test_entry_just_inside_limits() {
        let limits = ZipLimits::default()
            .with_max_entry_size(2 * 1024 * 1024)
            .with_min_inflate_ratio(0.000_01);
        let mut reader = SecureZipReader::from_bytes(zeros_archive(2 * 1024 * 1024), limits).unwrap();
        assert_eq!(reader.read("zeros.bin").unwrap().len(), 2 * 1024 * 1024);
    }

    #[test]
    fn test_entry_over_max_size() {
        let limits = ZipLimits::default().with_max_entry_size(1_000);
        let mut writer = StreamingArchiveWriter::new();
        writer.write_stored("a.bin", &[7u8; 1_001]).unwrap();
        let err = SecureZipReader::from_bytes(writer.finish_to_bytes().unwrap(), limits).unwrap_err();
        assert!(matches!(err, Error::EntryTooLarge { size: 1_001, .. }), "{err}");
    }

    #[test]
    fn test_closed_reader_refuses_reads() {
        let mut reader = SecureZipReader::from_bytes(sample_archive(), ZipLimits::default()).unwrap();
        reader.close();
        assert!(reader.is_closed());
        assert!(matches!(reader.read("word/document.xml"), Err(Error::Closed)));
        assert!(matches!(reader.read("missing.xml"), Err(Error::EntryNotFound(_))));
    }

    #[test]
    fn test_file_with_broken_central_directory_falls_back_to_stream() {
        let mut data = sample_archive();
        // Chop off the end-of-central-directory record.
        data.truncate(data.len() - 22);

        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("broken.zip");
        std::fs::File::create(&path).unwrap().write_all(&data).unwrap();

        let mut reader = SecureZipReader::open_file(&path, ZipLimits::default()).unwrap();
        assert_eq!(reader.source_kind(), SourceKind::Sequential);
        assert_eq!(reader.path(), Some(path.as_path()));
        assert_eq!(reader.read("word/document.xml").unwrap(), b"<w:document/>");

        let err = SecureZipReader::open_file_strict(&path, ZipLimits::default()).unwrap_err();
        assert!(matches!(err, Error::NotZip(_)), "{err}");
    }

    /// One empty stored entry whose sizes live in a data descriptor.
    fn data_descriptor_archive() -> Vec<u8> {
        let name = b"a.txt";
        let mut data = Vec::new();
        data.extend_from_slice(&[0x50, 0x4b, 0x03, 0x04, 20, 0, 0x08, 0, 0, 0, 0, 0, 0x21, 0]);
        data.extend_from_slice(&[0; 12]);
        data.extend_from_slice(&[name.len() as u8, 0, 0, 0]);
        data.extend_from_slice(name);
        data.extend_from_slice(&[0x50, 0x4b, 0x07, 0x08]);
        data.extend_from_slice(&[0; 12]);

        let central_offset = data.len() as u32;
        data.extend_from_slice(&[0x50, 0x4b, 0x01, 0x02, 20, 0, 20, 0, 0x08, 0, 0, 0, 0, 0, 0x21, 0]);
        data.extend_from_slice(&[0; 12]);
        data.extend_from_slice(&[name.len() as u8, 0, 0, 0, 0, 0]);
        data.extend_from_slice(&[0; 12]);
        data.extend_from_slice(name);
        let central_size = data.len() as u32 - central_offset;

        data.extend_from_slice(&[0x50, 0x4b, 0x05, 0x06, 0, 0, 0, 0, 1, 0, 1, 0]);
        data.extend_from_slice(&central_size.to_le_bytes());
        data.extend_from_slice(&central_offset.to_le_bytes());
        data.extend_from_slice(&[0, 0]);
        data
    }

    #[test]
    fn test_data_descriptor_entries_need_a_seekable_source() {
        let data = data_descriptor_archive();
        let mut reader = SecureZipReader::from_bytes(data.clone(), ZipLimits::default()).unwrap();
        assert_eq!(reader.len(), 1);
        assert_eq!(reader.read("a.txt").unwrap(), b"");

        let err = SecureZipReader::from_stream(&data[..], ZipLimits::default()).unwrap_err();
        assert!(matches!(err, Error::Zip(_)), "{err}");
    }

    #[test]
    fn test_reopen_after_close() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sample.zip");
        std::fs::write(&path, sample_archive()).unwrap();

        let mut reader = SecureZipReader::open_file(&path, ZipLimits::default()).unwrap();
        reader.close();
        reader.reopen().unwrap();
        assert!(!reader.is_closed());
        assert_eq!(reader.read("word/document.xml").unwrap(), b"<w:document/>");

        let mut in_memory = SecureZipReader::from_bytes(sample_archive(), ZipLimits::default()).unwrap();
        in_memory.close();
        assert!(matches!(in_memory.reopen(), Err(Error::Closed)));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = SecureZipReader::open_file(dir.path().join("nope.zip"), ZipLimits::default()).unwrap_err();
        assert!(matches!(err, Error::Io { .. }), "{err}");
    }
}
