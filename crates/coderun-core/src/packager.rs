//! Packs submitted source text into a single-entry tar archive
//!
//! The container runtime only accepts files as tar streams, so the source is
//! wrapped in an archive holding exactly one regular file. Packaging is pure:
//! nothing is written outside the in-memory buffer.

use bytes::Bytes;
use std::io::Write;
use tar::{Builder, EntryType, Header};

use crate::config::RuntimeConfig;
use crate::errors::ExecutionError;

/// Archive image ready to be copied into a container.
#[derive(Debug, Clone)]
pub struct PayloadArchive {
    bytes: Bytes,
    file_name: String,
    declared_size: u64,
}

impl PayloadArchive {
    pub fn file_name(&self) -> &str {
        &self.file_name
    }

    /// Size recorded in the entry header.
    pub fn declared_size(&self) -> u64 {
        self.declared_size
    }

    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }
}

#[derive(Debug, Clone)]
pub struct PayloadPackager {
    file_name: String,
    mode: u32,
}

impl PayloadPackager {
    pub fn new(file_name: impl Into<String>, mode: u32) -> Self {
        Self {
            file_name: file_name.into(),
            mode,
        }
    }

    pub fn from_config(config: &RuntimeConfig) -> Self {
        Self::new(config.file_name.clone(), config.file_mode)
    }

    /// Build the archive in memory.
    pub fn package(&self, source_text: &str) -> Result<PayloadArchive, ExecutionError> {
        let buffer = self.package_into(Vec::new(), source_text)?;
        Ok(PayloadArchive {
            bytes: Bytes::from(buffer),
            file_name: self.file_name.clone(),
            declared_size: source_text.len() as u64,
        })
    }

    /// Write the archive into `writer` and hand it back once finalized.
    pub fn package_into<W: Write>(
        &self,
        writer: W,
        source_text: &str,
    ) -> Result<W, ExecutionError> {
        let contents = source_text.as_bytes();

        let mut header = Header::new_gnu();
        header.set_entry_type(EntryType::Regular);
        header.set_size(contents.len() as u64);
        header.set_mode(self.mode);
        header.set_mtime(chrono::Utc::now().timestamp().max(0) as u64);

        let mut builder = Builder::new(writer);
        builder.append_data(&mut header, &self.file_name, contents)?;
        // into_inner writes the two terminating zero blocks
        let writer = builder.into_inner()?;
        Ok(writer)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{self, Cursor, Read};

    fn unpack(archive: PayloadArchive) -> Vec<(String, u32, u64, Vec<u8>)> {
        let mut reader = tar::Archive::new(Cursor::new(archive.into_bytes()));
        reader
            .entries()
            .unwrap()
            .map(|entry| {
                let mut entry = entry.unwrap();
                let path = entry.path().unwrap().display().to_string();
                let mode = entry.header().mode().unwrap();
                let size = entry.header().size().unwrap();
                let mut contents = Vec::new();
                entry.read_to_end(&mut contents).unwrap();
                (path, mode, size, contents)
            })
            .collect()
    }

    #[test]
    fn test_single_entry_round_trip() {
        let packager = PayloadPackager::new("main.go", 0o644);
        let source = "package main\n\nfunc main() { println(\"héllo\") }\n";
        let archive = packager.package(source).unwrap();
        assert_eq!(archive.declared_size(), source.len() as u64);

        let entries = unpack(archive);
        assert_eq!(entries.len(), 1);
        let (path, mode, size, contents) = &entries[0];
        assert_eq!(path, "main.go");
        assert_eq!(*mode, 0o644);
        assert_eq!(*size, source.len() as u64);
        assert_eq!(contents, source.as_bytes());
    }

    #[test]
    fn test_empty_source_yields_zero_length_file() {
        let packager = PayloadPackager::new("main.py", 0o600);
        let archive = packager.package("").unwrap();
        assert!(!archive.is_empty());

        let entries = unpack(archive);
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].2, 0);
        assert!(entries[0].3.is_empty());
        assert_eq!(entries[0].1, 0o600);
    }

    #[test]
    fn test_declared_size_counts_bytes_not_chars() {
        let packager = PayloadPackager::new("main.go", 0o644);
        let archive = packager.package("日本語").unwrap();
        assert_eq!(archive.declared_size(), 9);
    }

    #[derive(Debug)]
    struct BrokenWriter;

    impl Write for BrokenWriter {
        fn write(&mut self, _buf: &[u8]) -> io::Result<usize> {
            Err(io::Error::new(io::ErrorKind::Other, "disk on fire"))
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    #[test]
    fn test_write_failure_is_packaging_error() {
        let packager = PayloadPackager::new("main.go", 0o644);
        let err = packager.package_into(BrokenWriter, "fn main() {}").unwrap_err();
        assert!(matches!(err, ExecutionError::Packaging(_)));
        assert_eq!(err.status_code(), 500);
    }
}
