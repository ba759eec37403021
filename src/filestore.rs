//! # Filestore Module
//!
//! Path based file access used by the engine. All file operations of the send and receive
//! state machines, the playback directories and the queue dump command go through the
//! [VirtualFilestore] trait, so the engine can be run on top of an in-memory or flight
//! specific file system. The [NativeFilestore] implements it with [std::fs].
use spacepackets::cfdp::ChecksumType;
use spacepackets::ByteConversionError;
use std::{string::String, vec::Vec};

pub use std_mod::*;

#[derive(Debug, thiserror::Error)]
#[non_exhaustive]
pub enum FilestoreError {
    #[error("{0} does not exist")]
    NotFound(String),
    #[error("{0} already exists")]
    AlreadyExists(String),
    #[error("{0} is not a regular file")]
    NotAFile(String),
    #[error("{0} is not a directory")]
    NotADirectory(String),
    #[error("directory entry name is not valid UTF-8")]
    InvalidEntryName,
    #[error("buffer too small: {0}")]
    Buffer(#[from] ByteConversionError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    #[error("unsupported checksum type {0:?}")]
    UnsupportedChecksum(ChecksumType),
}

pub trait VirtualFilestore {
    /// Create an empty file. Fails if the path exists.
    fn create_file(&self, file_path: &str) -> Result<(), FilestoreError>;

    fn remove_file(&self, file_path: &str) -> Result<(), FilestoreError>;

    /// Move a file. An existing destination file is replaced.
    fn rename_file(&self, old_path: &str, new_path: &str) -> Result<(), FilestoreError>;

    fn create_dir(&self, dir_path: &str) -> Result<(), FilestoreError>;

    /// Names of the regular files inside a directory, sorted by name.
    fn read_dir(&self, dir_path: &str) -> Result<Vec<String>, FilestoreError>;

    /// Fill the first `read_len` bytes of `buf` with file content starting at `offset`.
    fn read_data(
        &self,
        file_path: &str,
        offset: u64,
        read_len: u64,
        buf: &mut [u8],
    ) -> Result<(), FilestoreError>;

    /// Write at an absolute offset. Writing past the end of the file extends it.
    fn write_data(&self, file_path: &str, offset: u64, buf: &[u8]) -> Result<(), FilestoreError>;

    fn is_file(&self, path: &str) -> Result<bool, FilestoreError>;

    fn is_dir(&self, path: &str) -> Result<bool, FilestoreError> {
        Ok(!self.is_file(path)?)
    }

    fn exists(&self, path: &str) -> Result<bool, FilestoreError>;

    fn file_size(&self, path: &str) -> Result<u64, FilestoreError>;

    /// Checksum over the first `size` bytes of a file, read in pieces of the size of `buf`.
    /// Used by class 1 receivers which verify the whole file at once when the EOF arrives.
    fn calculate_checksum(
        &self,
        file_path: &str,
        checksum_type: ChecksumType,
        size: u64,
        buf: &mut [u8],
    ) -> Result<u32, FilestoreError>;
}

pub mod std_mod {
    use super::*;
    use crate::checksum::FileChecksum;
    use std::{
        fs::{self, File, Metadata, OpenOptions},
        io::{self, Read, Seek, SeekFrom, Write},
        string::ToString,
    };

    /// Filestore on top of the file system of the host.
    #[derive(Debug, Default, Copy, Clone)]
    pub struct NativeFilestore {}

    fn metadata(path: &str) -> Result<Metadata, FilestoreError> {
        fs::metadata(path).map_err(|e| match e.kind() {
            io::ErrorKind::NotFound => FilestoreError::NotFound(path.to_string()),
            _ => FilestoreError::Io(e),
        })
    }

    /// Fails unless the path names an existing regular file.
    fn regular_file(path: &str) -> Result<Metadata, FilestoreError> {
        let meta = metadata(path)?;
        if !meta.is_file() {
            return Err(FilestoreError::NotAFile(path.to_string()));
        }
        Ok(meta)
    }

    impl VirtualFilestore for NativeFilestore {
        fn create_file(&self, file_path: &str) -> Result<(), FilestoreError> {
            OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(file_path)
                .map_err(|e| match e.kind() {
                    io::ErrorKind::AlreadyExists => {
                        FilestoreError::AlreadyExists(file_path.to_string())
                    }
                    _ => FilestoreError::Io(e),
                })?;
            Ok(())
        }

        fn remove_file(&self, file_path: &str) -> Result<(), FilestoreError> {
            regular_file(file_path)?;
            Ok(fs::remove_file(file_path)?)
        }

        fn rename_file(&self, old_path: &str, new_path: &str) -> Result<(), FilestoreError> {
            regular_file(old_path)?;
            Ok(fs::rename(old_path, new_path)?)
        }

        fn create_dir(&self, dir_path: &str) -> Result<(), FilestoreError> {
            Ok(fs::create_dir_all(dir_path)?)
        }

        fn read_dir(&self, dir_path: &str) -> Result<Vec<String>, FilestoreError> {
            if !metadata(dir_path)?.is_dir() {
                return Err(FilestoreError::NotADirectory(dir_path.to_string()));
            }
            let mut names = Vec::new();
            for entry in fs::read_dir(dir_path)? {
                let entry = entry?;
                if entry.file_type()?.is_file() {
                    names.push(
                        entry
                            .file_name()
                            .into_string()
                            .map_err(|_| FilestoreError::InvalidEntryName)?,
                    );
                }
            }
            names.sort_unstable();
            Ok(names)
        }

        fn read_data(
            &self,
            file_path: &str,
            offset: u64,
            read_len: u64,
            buf: &mut [u8],
        ) -> Result<(), FilestoreError> {
            let found = buf.len();
            let target = buf
                .get_mut(..read_len as usize)
                .ok_or(ByteConversionError::ToSliceTooSmall {
                    found,
                    expected: read_len as usize,
                })?;
            regular_file(file_path)?;
            let mut file = File::open(file_path)?;
            file.seek(SeekFrom::Start(offset))?;
            file.read_exact(target)?;
            Ok(())
        }

        fn write_data(
            &self,
            file_path: &str,
            offset: u64,
            buf: &[u8],
        ) -> Result<(), FilestoreError> {
            regular_file(file_path)?;
            let mut file = OpenOptions::new().write(true).open(file_path)?;
            file.seek(SeekFrom::Start(offset))?;
            file.write_all(buf)?;
            Ok(())
        }

        fn is_file(&self, path: &str) -> Result<bool, FilestoreError> {
            Ok(metadata(path)?.is_file())
        }

        fn is_dir(&self, path: &str) -> Result<bool, FilestoreError> {
            Ok(metadata(path)?.is_dir())
        }

        fn exists(&self, path: &str) -> Result<bool, FilestoreError> {
            match metadata(path) {
                Ok(_) => Ok(true),
                Err(FilestoreError::NotFound(_)) => Ok(false),
                Err(e) => Err(e),
            }
        }

        fn file_size(&self, path: &str) -> Result<u64, FilestoreError> {
            Ok(regular_file(path)?.len())
        }

        fn calculate_checksum(
            &self,
            file_path: &str,
            checksum_type: ChecksumType,
            size: u64,
            buf: &mut [u8],
        ) -> Result<u32, FilestoreError> {
            let mut checksum = FileChecksum::new(checksum_type)
                .ok_or(FilestoreError::UnsupportedChecksum(checksum_type))?;
            if checksum_type == ChecksumType::NullChecksum || size == 0 {
                return Ok(checksum.finalize());
            }
            if buf.is_empty() {
                return Err(ByteConversionError::ToSliceTooSmall {
                    found: 0,
                    expected: 1,
                }
                .into());
            }
            let mut reader = File::open(file_path)?.take(size);
            loop {
                let len = reader.read(buf)?;
                if len == 0 {
                    break;
                }
                checksum.update(&buf[..len]);
            }
            Ok(checksum.finalize())
        }
    }
}
