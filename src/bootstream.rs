//! Boot media abstraction: where the boot sector and any follow-on disk
//! reads (INT 13h) come from.

use crate::error::RunError;
use std::fs::File;
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;

pub const SECTOR_SIZE: usize = 512;
const BOOT_SIGNATURE_OFFSET: usize = 510;
const BOOT_SIGNATURE: [u8; 2] = [0x55, 0xAA];

pub trait BootStream: std::fmt::Debug {
    /// Total size of the medium in bytes.
    fn size(&self) -> u64;
    /// Read `buf.len()` bytes starting at byte offset `addr`. Short reads at
    /// the end of the medium are zero-filled, matching a disk image padded
    /// out to a whole number of sectors.
    fn read_at(&mut self, addr: u64, buf: &mut [u8]) -> std::io::Result<()>;

    fn read_sector(&mut self, lba: u64, buf: &mut [u8; SECTOR_SIZE]) -> std::io::Result<()> {
        self.read_at(lba * SECTOR_SIZE as u64, buf)
    }

    /// Verify the MBR boot signature (`0x55AA` at offset 510) that
    /// `Machine::new` checks before running anything.
    fn verify_boot_signature(&mut self) -> Result<(), RunError> {
        let mut sector = [0u8; SECTOR_SIZE];
        self.read_at(0, &mut sector)
            .map_err(RunError::Io)?;
        if sector[BOOT_SIGNATURE_OFFSET..BOOT_SIGNATURE_OFFSET + 2] != BOOT_SIGNATURE {
            return Err(RunError::Config(
                "boot medium is missing the 0x55AA boot signature".into(),
            ));
        }
        Ok(())
    }
}

/// A disk image backed by an open file, read lazily via `pread`-style seeks.
#[derive(Debug)]
pub struct FileBootStream {
    file: File,
    size: u64,
}

impl FileBootStream {
    pub fn open(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let file = File::open(path)?;
        let size = file.metadata()?.len();
        Ok(FileBootStream { file, size })
    }
}

impl BootStream for FileBootStream {
    fn size(&self) -> u64 {
        self.size
    }

    fn read_at(&mut self, addr: u64, buf: &mut [u8]) -> std::io::Result<()> {
        buf.fill(0);
        if addr >= self.size {
            return Ok(());
        }
        self.file.seek(SeekFrom::Start(addr))?;
        let available = (self.size - addr).min(buf.len() as u64) as usize;
        self.file.read_exact(&mut buf[..available]).or_else(|e| {
            if e.kind() == std::io::ErrorKind::UnexpectedEof {
                Ok(())
            } else {
                Err(e)
            }
        })
    }
}

/// An in-memory disk image, used by tests that hand-assemble boot sectors
/// without touching the filesystem.
#[derive(Debug, Clone)]
pub struct InMemoryBootStream {
    data: Vec<u8>,
}

impl InMemoryBootStream {
    pub fn new(data: Vec<u8>) -> Self {
        InMemoryBootStream { data }
    }

    /// Build a one-sector image from `code`, zero-padded up to the boot
    /// signature and stamped with `0x55AA`.
    pub fn single_sector(code: &[u8]) -> Self {
        assert!(code.len() <= BOOT_SIGNATURE_OFFSET, "boot code overruns the signature");
        let mut data = vec![0u8; SECTOR_SIZE];
        data[..code.len()].copy_from_slice(code);
        data[BOOT_SIGNATURE_OFFSET..].copy_from_slice(&BOOT_SIGNATURE);
        InMemoryBootStream { data }
    }
}

impl BootStream for InMemoryBootStream {
    fn size(&self) -> u64 {
        self.data.len() as u64
    }

    fn read_at(&mut self, addr: u64, buf: &mut [u8]) -> std::io::Result<()> {
        buf.fill(0);
        let addr = addr as usize;
        if addr >= self.data.len() {
            return Ok(());
        }
        let available = (self.data.len() - addr).min(buf.len());
        buf[..available].copy_from_slice(&self.data[addr..addr + available]);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_sector_carries_boot_signature() {
        let mut s = InMemoryBootStream::single_sector(&[0xF4]); // HLT
        let mut sector = [0u8; SECTOR_SIZE];
        s.read_sector(0, &mut sector).unwrap();
        assert_eq!(sector[0], 0xF4);
        assert_eq!(&sector[510..512], &[0x55, 0xAA]);
        s.verify_boot_signature().unwrap();
    }

    #[test]
    fn missing_signature_is_rejected() {
        let mut s = InMemoryBootStream::new(vec![0u8; SECTOR_SIZE]);
        assert!(s.verify_boot_signature().is_err());
    }
}
