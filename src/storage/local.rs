//! Local-filesystem storage backend.

use std::fs::{self, File};
use std::io::{BufReader, BufWriter, Read, Seek, SeekFrom, Write};
use std::path::PathBuf;

use super::{DirectoryList, Storage, StorageReader, StorageSpecifier, StorageWriter};
use crate::{Error, Result};

/// Archive storage on the local filesystem.
#[derive(Debug, Default, Clone, Copy)]
pub struct LocalStorage;

impl LocalStorage {
    /// Creates the backend.
    pub fn new() -> Self {
        Self
    }
}

struct LocalReader {
    file: BufReader<File>,
    size: u64,
    position: u64,
}

impl StorageReader for LocalReader {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize> {
        let n = self.file.read(buf)?;
        self.position += n as u64;
        Ok(n)
    }

    fn seek(&mut self, offset: u64) -> Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.position = offset;
        Ok(())
    }

    fn size(&mut self) -> Result<u64> {
        Ok(self.size)
    }

    fn eof(&mut self) -> bool {
        self.position >= self.size
    }
}

struct LocalWriter {
    file: Option<BufWriter<File>>,
    path: PathBuf,
}

impl StorageWriter for LocalWriter {
    fn write(&mut self, buf: &[u8]) -> Result<()> {
        match &mut self.file {
            Some(f) => {
                f.write_all(buf)?;
                Ok(())
            }
            None => Err(Error::Io(std::io::Error::new(
                std::io::ErrorKind::BrokenPipe,
                format!("storage writer for '{}' already closed", self.path.display()),
            ))),
        }
    }

    fn close(&mut self) -> Result<()> {
        if let Some(mut f) = self.file.take() {
            f.flush()?;
            f.into_inner().map_err(|e| Error::Io(e.into_error()))?.sync_all()?;
        }
        Ok(())
    }
}

struct LocalDirectoryList {
    entries: std::vec::IntoIter<String>,
}

impl DirectoryList for LocalDirectoryList {
    fn read_next(&mut self) -> Result<Option<String>> {
        Ok(self.entries.next())
    }
}

impl Storage for LocalStorage {
    fn open_read(&self, spec: &StorageSpecifier) -> Result<Box<dyn StorageReader>> {
        let file = File::open(&spec.path).map_err(|e| match e.kind() {
            std::io::ErrorKind::NotFound => Error::FileNotFound {
                path: spec.path.display().to_string(),
            },
            _ => Error::Io(e),
        })?;
        let size = file.metadata()?.len();
        Ok(Box::new(LocalReader {
            file: BufReader::new(file),
            size,
            position: 0,
        }))
    }

    fn open_write(
        &self,
        spec: &StorageSpecifier,
        _expected_size: u64,
    ) -> Result<Box<dyn StorageWriter>> {
        if let Some(parent) = spec.path.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }
        let file = File::create(&spec.path)?;
        Ok(Box::new(LocalWriter {
            file: Some(BufWriter::new(file)),
            path: spec.path.clone(),
        }))
    }

    fn open_directory_list(&self, spec: &StorageSpecifier) -> Result<Box<dyn DirectoryList>> {
        let dir = match spec.path.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let mut entries = Vec::new();
        for entry in fs::read_dir(&dir)? {
            let entry = entry?;
            if let Some(name) = entry.file_name().to_str() {
                entries.push(name.to_string());
            }
        }
        entries.sort();
        Ok(Box::new(LocalDirectoryList {
            entries: entries.into_iter(),
        }))
    }

    fn exists(&self, spec: &StorageSpecifier) -> bool {
        spec.path.exists()
    }
}
