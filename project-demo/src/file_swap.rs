//! FileSwap - swap file living in the host file system.
//!
//! The layout is as plain as it gets: no header, just page-sized slots one
//! after the other. Slot `i` starts at byte `i * page_size`:
//!
//! | offset              | contents        |
//! |---------------------|-----------------|
//! | 0                   | slot 0          |
//! | page_size           | slot 1          |
//! | ...                 | ...             |
//! | n * page_size       | slot n          |
//!
//! Which page sits in which slot is kept in memory by the pager, so the file
//! is meaningless after a restart and gets truncated on open.

use std::{
    fs::File,
    io::{self, Read, Seek, SeekFrom, Write},
    path::Path,
};

use log::debug;
use vm::swap::SwapFile;

#[derive(Debug)]
pub struct FileSwap {
    file: File,
}

impl FileSwap {
    /// Opens `path`, creating it if needed and dropping any old contents.
    pub fn create<P: AsRef<Path>>(path: P) -> io::Result<FileSwap> {
        let file = File::options()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(path.as_ref())?;

        debug!("swap: using {}", path.as_ref().display());

        Ok(FileSwap { file })
    }
}

impl SwapFile for FileSwap {
    fn read_at(&mut self, offset: u64, buffer: &mut [u8]) -> io::Result<()> {
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.read_exact(buffer)
    }

    fn write_at(&mut self, offset: u64, buffer: &[u8]) -> io::Result<()> {
        // Seeking past the end is fine: the hole reads back as zeroes.
        self.file.seek(SeekFrom::Start(offset))?;
        self.file.write_all(buffer)
    }

    fn close(&mut self) -> io::Result<()> {
        self.file.sync_all()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use vm::{swap::SwapStore, PageKey};

    #[test]
    fn slots_land_at_page_aligned_offsets() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("SWAP");
        let mut swap = SwapStore::new(Box::new(FileSwap::create(&path).unwrap()), 4);

        swap.write(PageKey::new(1, 0), &[1; 4]).unwrap();
        swap.write(PageKey::new(1, 1), &[2; 4]).unwrap();
        swap.write(PageKey::new(2, 0), &[3; 4]).unwrap();
        swap.close().unwrap();

        assert_eq!(std::fs::read(&path).unwrap(), [[1u8; 4], [2; 4], [3; 4]].concat());
    }

    #[test]
    fn reused_slot_is_overwritten_in_place() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("SWAP");
        let mut swap = SwapStore::new(Box::new(FileSwap::create(&path).unwrap()), 4);

        swap.write(PageKey::new(1, 0), &[1; 4]).unwrap();
        swap.write(PageKey::new(1, 1), &[2; 4]).unwrap();
        swap.release(PageKey::new(1, 0));
        assert_eq!(swap.write(PageKey::new(5, 7), &[9; 4]).unwrap(), 0);

        let mut page = [0; 4];
        swap.read(PageKey::new(5, 7), &mut page).unwrap();
        assert_eq!(page, [9; 4]);
        assert_eq!(std::fs::metadata(&path).unwrap().len(), 8);
    }

    #[test]
    fn create_truncates_a_stale_file() {
        let file = tempfile::NamedTempFile::new().unwrap();
        std::fs::write(file.path(), [0xFF; 64]).unwrap();

        let mut swap = FileSwap::create(file.path()).unwrap();
        let mut page = [0; 4];
        assert!(swap.read_at(0, &mut page).is_err());
    }
}
