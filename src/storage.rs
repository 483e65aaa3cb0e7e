//! Positional file IO for a torrent's on-disk files.
//!
//! `Storage` knows nothing about pieces, hashes or progress: it only maps
//! torrent-relative byte offsets onto file handles and positional reads and
//! writes. Piece assembly, hashing and verification live one layer up, in
//! [`crate::manager`].

use std::fs::{self, File, OpenOptions};
use std::os::unix::io::AsRawFd;

use nix::sys::uio::{pread, pwrite};

use crate::error::{Error, Result};
use crate::storage_info::{FileSlice, StorageInfo};
use crate::FileIndex;

/// A torrent's files, opened (and created, if missing) on disk.
pub(crate) struct Storage {
    info: StorageInfo,
    files: Vec<File>,
}

impl Storage {
    /// Opens (creating directories and files as necessary) all files that
    /// make up the torrent, preallocating each to its final length.
    pub fn new(info: StorageInfo) -> Result<Self> {
        fs::create_dir_all(&info.download_dir)?;

        let file_infos = info.structure.files();
        let mut files = Vec::with_capacity(file_infos.len());
        for file_info in file_infos {
            let path = info.download_dir.join(&file_info.path);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new()
                .read(true)
                .write(true)
                .create(true)
                .open(&path)?;
            file.set_len(file_info.len)?;
            files.push(file);
        }

        Ok(Self { info, files })
    }

    /// Reads the bytes at `torrent_offset..torrent_offset + buf.len()` into
    /// `buf`, which may span more than one underlying file.
    ///
    /// # Panics
    ///
    /// Panics (via [`Error::OutOfBounds`] only reaching here is already a
    /// programming error upstream) if the requested range extends past the
    /// end of the torrent's address space, and panics if a read returns
    /// fewer bytes than requested for a region that should be fully backed
    /// by the file's preallocated length — partial positional IO here means
    /// the file was externally truncated and there's nothing sensible left
    /// to do but fail loudly.
    pub fn read_at(&self, torrent_offset: u64, buf: &mut [u8]) -> Result<()> {
        self.for_each_file_slice(torrent_offset, buf.len() as u64, |file, slice, buf_offset| {
            let dst = &mut buf[buf_offset..buf_offset + slice.len as usize];
            let n = pread(file.as_raw_fd(), dst, slice.offset as i64)
                .map_err(|e| Error::Io(std::io::Error::from(e)))?;
            assert_eq!(
                n,
                dst.len(),
                "partial positional read: file was truncated externally"
            );
            Ok(())
        })
    }

    /// Writes `buf` at `torrent_offset..torrent_offset + buf.len()`, which
    /// may span more than one underlying file.
    pub fn write_at(&self, torrent_offset: u64, buf: &[u8]) -> Result<()> {
        self.for_each_file_slice(torrent_offset, buf.len() as u64, |file, slice, buf_offset| {
            let src = &buf[buf_offset..buf_offset + slice.len as usize];
            let n = pwrite(file.as_raw_fd(), src, slice.offset as i64)
                .map_err(|e| Error::Io(std::io::Error::from(e)))?;
            assert_eq!(
                n,
                src.len(),
                "partial positional write: disk full or file truncated externally"
            );
            Ok(())
        })
    }

    fn for_each_file_slice(
        &self,
        torrent_offset: u64,
        len: u64,
        mut f: impl FnMut(&File, FileSlice, usize) -> Result<()>,
    ) -> Result<()> {
        let byte_range = torrent_offset..torrent_offset + len;
        if byte_range.end > self.info.download_len {
            return Err(Error::OutOfBounds);
        }

        let file_range: std::ops::Range<FileIndex> =
            self.info.structure.files_intersecting_bytes(byte_range);
        let mut buf_offset = 0usize;
        for file_index in file_range {
            let file_info = &self.info.structure.files()[file_index];
            let remaining = len - buf_offset as u64;
            let slice =
                file_info.get_slice(torrent_offset + buf_offset as u64, remaining);
            f(&self.files[file_index], slice, buf_offset)?;
            buf_offset += slice.len as usize;
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metainfo::{File as MetainfoFile, Info, Metainfo};
    use pretty_assertions::assert_eq;

    fn three_file_metainfo() -> Metainfo {
        Metainfo {
            info: Info {
                name: "archive".into(),
                pieces: vec![0u8; 20],
                piece_length: 0x4000,
                length: None,
                files: Some(vec![
                    MetainfoFile {
                        path: vec!["a.bin".into()],
                        length: 0x10000,
                    },
                    MetainfoFile {
                        path: vec!["b.bin".into()],
                        length: 0x10000,
                    },
                    MetainfoFile {
                        path: vec!["c.bin".into()],
                        length: 0x10000,
                    },
                ]),
                private: None,
            },
            announce: "udp://tracker.example.com:6969/announce".into(),
            announce_list: None,
        }
    }

    #[test]
    fn test_write_read_across_file_boundary() {
        let dir = tempfile::tempdir().unwrap();
        let metainfo = three_file_metainfo();
        let info = StorageInfo::new(&metainfo, dir.path().to_path_buf());
        let storage = Storage::new(info).unwrap();

        // a write that starts in the first file and ends in the second
        let write_offset = 0x10000 - 4;
        let data: Vec<u8> = (0..16).collect();
        storage.write_at(write_offset, &data).unwrap();

        let mut readback = vec![0u8; data.len()];
        storage.read_at(write_offset, &mut readback).unwrap();
        assert_eq!(readback, data);
    }

    #[test]
    fn test_out_of_bounds_write_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let metainfo = three_file_metainfo();
        let info = StorageInfo::new(&metainfo, dir.path().to_path_buf());
        let storage = Storage::new(info).unwrap();

        let data = [0u8; 8];
        assert!(storage.write_at(3 * 0x10000, &data).is_err());
    }
}
