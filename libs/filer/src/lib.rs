//! # filer
//!
//! Filesystem access for the send pipeline. Everything that touches disk
//! (reading request payloads, unpacking archives, writing saved artifacts)
//! goes through the [`Filer`] trait so it can be swapped out in tests.
#![warn(
    missing_debug_implementations,
    missing_docs,
    rust_2018_idioms,
    unreachable_pub,
    non_snake_case,
    non_upper_case_globals
)]
#![allow(clippy::cognitive_complexity)]
use std::{
    fmt,
    fs::{self, File},
    io::{self, Cursor, Read, Seek, Write},
    path::{Path, PathBuf},
};

use flate2::read::GzDecoder;
use thiserror::Error;
use tracing::{debug, trace};

pub use content::ContentType;

mod content;

/// number of leading bytes inspected when sniffing
pub const SNIFF_LEN: usize = 512;

/// Errors from filesystem access, each naming the path involved
#[derive(Debug, Error)]
pub enum FilerError {
    /// reading, writing or listing `path` failed
    #[error("io error on {path:?}: {source}")]
    Io {
        /// path involved
        path: PathBuf,
        /// underlying error
        #[source]
        source: io::Error,
    },
    /// `path` looked like a zip but could not be read as one
    #[error("bad zip archive {path:?}: {source}")]
    Zip {
        /// archive path
        path: PathBuf,
        /// zip error
        #[source]
        source: zip::result::ZipError,
    },
    /// `read_archive` was given something other than gzip or zip
    #[error("{path:?} is {content_type}, not a supported archive")]
    NotArchive {
        /// file that was read
        path: PathBuf,
        /// what it sniffed as
        content_type: ContentType,
    },
    /// a directory was expected
    #[error("{0:?} is not a directory")]
    NotADirectory(PathBuf),
}

impl FilerError {
    fn io(path: &Path, source: io::Error) -> Self {
        FilerError::Io {
            path: path.to_path_buf(),
            source,
        }
    }
}

/// filer result
pub type Result<T, E = FilerError> = std::result::Result<T, E>;

/// Filesystem collaborator. Calls block; async callers should move them
/// onto a blocking thread.
pub trait Filer: Send + Sync + fmt::Debug {
    /// sniff the content type from the leading bytes of `path`
    fn determine_content_type(&self, path: &Path) -> Result<ContentType>;
    /// read the whole file
    fn read_file(&self, path: &Path) -> Result<Vec<u8>>;
    /// read and decompress a gzip or zip file
    fn read_archive(&self, path: &Path) -> Result<Vec<u8>>;
    /// join `name` onto `dir`, `dir` must be an existing directory
    fn build_file_path(&self, dir: &Path, name: &str) -> Result<PathBuf>;
    /// create or truncate `path` for writing
    fn create_file(&self, path: &Path) -> Result<File>;
    /// write all of `buf` to `file`, opened from `path`
    fn write_file(&self, path: &Path, file: &mut File, buf: &[u8]) -> Result<usize>;
    /// flush `file` to disk and close it
    fn close_file(&self, path: &Path, file: File) -> Result<()>;
    /// create `path` and any missing parents
    fn mkdir_all(&self, path: &Path) -> Result<()>;
    /// remove every child of `dir`, keeping `dir` itself
    fn clean_dir(&self, dir: &Path) -> Result<()>;

    /// Read the request payload, unpacking archives transparently.
    fn read_content(&self, path: &Path) -> Result<Vec<u8>> {
        let content_type = self.determine_content_type(path)?;
        trace!(?path, %content_type, "read content");
        if content_type.is_archive() {
            self.read_archive(path)
        } else {
            self.read_file(path)
        }
    }

    /// Write `buf` into `dir/name`, returning the path written.
    fn save(&self, dir: &Path, name: &str, buf: &[u8]) -> Result<PathBuf> {
        let path = self.build_file_path(dir, name)?;
        let mut file = self.create_file(&path)?;
        let written = self.write_file(&path, &mut file, buf)?;
        self.close_file(&path, file)?;
        debug!(?path, written, "saved file");
        Ok(path)
    }
}

/// [`Filer`] backed by `std::fs`
#[derive(Debug, Default, Clone, Copy)]
pub struct FsFiler;

impl FsFiler {
    /// a filer on the local filesystem
    pub fn new() -> Self {
        Self
    }
}

impl Filer for FsFiler {
    fn determine_content_type(&self, path: &Path) -> Result<ContentType> {
        let file = File::open(path).map_err(|e| FilerError::io(path, e))?;
        let mut buf = Vec::with_capacity(SNIFF_LEN);
        file.take(SNIFF_LEN as u64)
            .read_to_end(&mut buf)
            .map_err(|e| FilerError::io(path, e))?;
        let content_type = ContentType::sniff(&buf);
        debug!(?path, %content_type, "determined file content type");
        Ok(content_type)
    }

    fn read_file(&self, path: &Path) -> Result<Vec<u8>> {
        fs::read(path).map_err(|e| FilerError::io(path, e))
    }

    fn read_archive(&self, path: &Path) -> Result<Vec<u8>> {
        let content_type = self.determine_content_type(path)?;
        let file = File::open(path).map_err(|e| FilerError::io(path, e))?;
        unpack(path, content_type, file)
    }

    // one read: sniff the buffer in memory and unpack from it
    fn read_content(&self, path: &Path) -> Result<Vec<u8>> {
        let buf = self.read_file(path)?;
        let content_type = ContentType::sniff(&buf[..buf.len().min(SNIFF_LEN)]);
        trace!(?path, %content_type, len = buf.len(), "read content");
        if content_type.is_archive() {
            unpack(path, content_type, Cursor::new(buf))
        } else {
            Ok(buf)
        }
    }

    fn build_file_path(&self, dir: &Path, name: &str) -> Result<PathBuf> {
        if !dir.is_dir() {
            return Err(FilerError::NotADirectory(dir.to_path_buf()));
        }
        Ok(dir.join(name))
    }

    fn create_file(&self, path: &Path) -> Result<File> {
        File::create(path).map_err(|e| FilerError::io(path, e))
    }

    fn write_file(&self, path: &Path, file: &mut File, buf: &[u8]) -> Result<usize> {
        file.write_all(buf).map_err(|e| FilerError::io(path, e))?;
        Ok(buf.len())
    }

    fn close_file(&self, path: &Path, file: File) -> Result<()> {
        file.sync_all().map_err(|e| FilerError::io(path, e))
    }

    fn mkdir_all(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(path).map_err(|e| FilerError::io(path, e))
    }

    fn clean_dir(&self, dir: &Path) -> Result<()> {
        for entry in fs::read_dir(dir).map_err(|e| FilerError::io(dir, e))? {
            let entry = entry.map_err(|e| FilerError::io(dir, e))?;
            let path = entry.path();
            let file_type = entry.file_type().map_err(|e| FilerError::io(&path, e))?;
            if file_type.is_dir() {
                fs::remove_dir_all(&path)
            } else {
                fs::remove_file(&path)
            }
            .map_err(|e| FilerError::io(&path, e))?;
        }
        Ok(())
    }
}

/// Decompress gzip, or concatenate the file entries of a zip. `path` only
/// labels errors.
fn unpack<R: Read + Seek>(path: &Path, content_type: ContentType, reader: R) -> Result<Vec<u8>> {
    let mut out = Vec::new();
    match content_type {
        ContentType::Gzip => {
            GzDecoder::new(reader)
                .read_to_end(&mut out)
                .map_err(|e| FilerError::io(path, e))?;
        }
        ContentType::Zip => {
            let zip_err = |source| FilerError::Zip {
                path: path.to_path_buf(),
                source,
            };
            let mut archive = zip::ZipArchive::new(reader).map_err(zip_err)?;
            for i in 0..archive.len() {
                let mut entry = archive.by_index(i).map_err(zip_err)?;
                if !entry.is_file() {
                    continue;
                }
                trace!(name = entry.name(), size = entry.size(), "unzip entry");
                entry
                    .read_to_end(&mut out)
                    .map_err(|e| FilerError::io(path, e))?;
            }
        }
        content_type => {
            return Err(FilerError::NotArchive {
                path: path.to_path_buf(),
                content_type,
            });
        }
    }
    Ok(out)
}

#[cfg(test)]
mod tests {
    use super::*;
    use flate2::{Compression, write::GzEncoder};
    use zip::write::SimpleFileOptions;

    fn write(dir: &Path, name: &str, buf: &[u8]) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, buf).unwrap();
        path
    }

    #[test]
    fn test_plain_file_read_raw() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "req.txt", b"GET / HTTP/1.1");
        let filer = FsFiler::new();
        assert_eq!(
            filer.determine_content_type(&path).unwrap(),
            ContentType::Unknown
        );
        assert_eq!(filer.read_content(&path).unwrap(), b"GET / HTTP/1.1");
    }

    #[test]
    fn test_empty_file_is_unknown() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "empty", b"");
        let filer = FsFiler::new();
        assert_eq!(
            filer.determine_content_type(&path).unwrap(),
            ContentType::Unknown
        );
        assert!(filer.read_content(&path).unwrap().is_empty());
    }

    #[test]
    fn test_gzip_decompressed() {
        let dir = tempfile::tempdir().unwrap();
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b"hello gzip payload").unwrap();
        let path = write(dir.path(), "req.gz", &enc.finish().unwrap());

        let filer = FsFiler::new();
        assert_eq!(
            filer.determine_content_type(&path).unwrap(),
            ContentType::Gzip
        );
        assert_eq!(filer.read_content(&path).unwrap(), b"hello gzip payload");
    }

    #[test]
    fn test_zip_entries_concatenated() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("req.zip");
        let mut zip = zip::ZipWriter::new(File::create(&path).unwrap());
        let opts =
            SimpleFileOptions::default().compression_method(zip::CompressionMethod::Stored);
        zip.add_directory("nested/", opts).unwrap();
        zip.start_file("nested/a.txt", opts).unwrap();
        zip.write_all(b"first,").unwrap();
        zip.start_file("b.txt", opts).unwrap();
        zip.write_all(b"second").unwrap();
        zip.finish().unwrap();

        let filer = FsFiler::new();
        assert_eq!(
            filer.determine_content_type(&path).unwrap(),
            ContentType::Zip
        );
        assert_eq!(filer.read_content(&path).unwrap(), b"first,second");
    }

    #[test]
    fn test_read_archive_rejects_plain() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "plain", b"not compressed");
        let err = FsFiler::new().read_archive(&path).unwrap_err();
        assert!(matches!(
            err,
            FilerError::NotArchive {
                content_type: ContentType::Unknown,
                ..
            }
        ));
    }

    #[test]
    fn test_missing_file_is_io_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = FsFiler::new()
            .read_content(&dir.path().join("nope"))
            .unwrap_err();
        assert!(matches!(err, FilerError::Io { .. }));
    }

    #[test]
    fn test_build_file_path() {
        let dir = tempfile::tempdir().unwrap();
        let filer = FsFiler::new();
        assert_eq!(
            filer.build_file_path(dir.path(), "001.res").unwrap(),
            dir.path().join("001.res")
        );
        assert!(matches!(
            filer.build_file_path(&dir.path().join("missing"), "001.res"),
            Err(FilerError::NotADirectory(_))
        ));
    }

    #[test]
    fn test_save_and_clean_dir() {
        let dir = tempfile::tempdir().unwrap();
        let filer = FsFiler::new();
        let nested = dir.path().join("session");
        filer.mkdir_all(&nested).unwrap();
        let saved = filer.save(&nested, "001.a.req", b"payload").unwrap();
        assert_eq!(fs::read(&saved).unwrap(), b"payload");
        write(dir.path(), "loose", b"x");

        filer.clean_dir(dir.path()).unwrap();
        assert!(dir.path().is_dir());
        assert_eq!(fs::read_dir(dir.path()).unwrap().count(), 0);
    }

    #[test]
    fn test_unpack_from_memory() {
        // no file behind the path, the archive is unpacked from the buffer alone
        let mut enc = GzEncoder::new(Vec::new(), Compression::default());
        enc.write_all(b"in memory").unwrap();
        let gz = enc.finish().unwrap();
        let path = Path::new("does-not-exist.gz");
        assert_eq!(
            unpack(path, ContentType::sniff(&gz), Cursor::new(gz)).unwrap(),
            b"in memory"
        );

        let err = unpack(path, ContentType::Zip, Cursor::new(b"PK\x03\x04junk".to_vec()))
            .unwrap_err();
        assert!(matches!(err, FilerError::Zip { ref path, .. } if path == Path::new("does-not-exist.gz")));
    }

    #[test]
    fn test_write_error_names_path() {
        let dir = tempfile::tempdir().unwrap();
        let path = write(dir.path(), "001.res", b"");
        // read-only handle, writes fail
        let mut file = File::open(&path).unwrap();
        let err = FsFiler::new()
            .write_file(&path, &mut file, b"payload")
            .unwrap_err();
        match &err {
            FilerError::Io { path: failed, .. } => assert_eq!(failed, &path),
            other => panic!("unexpected error {other:?}"),
        }
        assert!(err.to_string().contains("001.res"), "{err}");
    }
}
