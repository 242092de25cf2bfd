use crate::errors::Error;
use crate::pages::PAGE_SIZE;
use anyhow::{anyhow, Context, Result};
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::Path;

pub const SECTOR_SIZE: usize = 512;
pub const SECTORS_PER_PAGE: usize = PAGE_SIZE / SECTOR_SIZE;

pub type SectorId = u64;

#[cfg(test)]
pub fn test_path() -> String {
    use uuid::Uuid;

    let id = Uuid::new_v4(); // Generate a unique UUID
    format!("data/test/test_{}.disk", id)
}

/// Synchronous sector-addressed storage. The disk cache and the swap
/// backend both sit directly on top of this.
pub trait BlockDevice: Send + Sync {
    /// Read one sector into `buf`. `buf` must be exactly [`SECTOR_SIZE`] long.
    fn read(&self, sector: SectorId, buf: &mut [u8]) -> Result<()>;
    /// Write one sector from `buf`. `buf` must be exactly [`SECTOR_SIZE`] long.
    fn write(&self, sector: SectorId, buf: &[u8]) -> Result<()>;
    /// Device capacity in sectors.
    fn size(&self) -> u64;
}

/// A fixed-size disk backed by a single file on the host filesystem.
#[derive(Debug)]
pub struct FileDisk {
    file: Mutex<File>,
    sectors: u64,
}

impl FileDisk {
    pub fn new(path: &str, sectors: u64) -> Result<Self> {
        if let Some(dir) = Path::new(path).parent() {
            std::fs::create_dir_all(dir)?;
        }

        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(false) // don't overwrite existing file
            .open(path)
            .context("disk file opened")?;
        file.set_len(sectors * SECTOR_SIZE as u64)?;

        Ok(Self {
            file: Mutex::new(file),
            sectors,
        })
    }

    fn check_range(&self, sector: SectorId, len: usize) -> Result<()> {
        if sector >= self.sectors {
            return Err(anyhow!(Error::IoFailure(format!(
                "sector {sector} out of range ({} sectors)",
                self.sectors
            ))));
        }
        if len != SECTOR_SIZE {
            return Err(anyhow!(Error::IoFailure(format!(
                "sector buffer is {len} bytes"
            ))));
        }
        Ok(())
    }
}

impl BlockDevice for FileDisk {
    fn read(&self, sector: SectorId, buf: &mut [u8]) -> Result<()> {
        self.check_range(sector, buf.len())?;

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(sector * SECTOR_SIZE as u64))?;
        file.read_exact(buf)
            .map_err(|e| anyhow!(Error::IoFailure(format!("read sector {sector}: {e}"))))
    }

    fn write(&self, sector: SectorId, buf: &[u8]) -> Result<()> {
        self.check_range(sector, buf.len())?;

        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(sector * SECTOR_SIZE as u64))?;
        file.write_all(buf)
            .map_err(|e| anyhow!(Error::IoFailure(format!("write sector {sector}: {e}"))))
    }

    fn size(&self) -> u64 {
        self.sectors
    }
}

/// An in-memory disk, mainly for tests and for swap devices that do not
/// need to survive the context.
#[derive(Debug)]
pub struct MemDisk {
    data: Mutex<Vec<u8>>,
    sectors: u64,
}

impl MemDisk {
    pub fn new(sectors: u64) -> Self {
        Self {
            data: Mutex::new(vec![0u8; sectors as usize * SECTOR_SIZE]),
            sectors,
        }
    }
}

impl BlockDevice for MemDisk {
    fn read(&self, sector: SectorId, buf: &mut [u8]) -> Result<()> {
        if sector >= self.sectors || buf.len() != SECTOR_SIZE {
            return Err(anyhow!(Error::IoFailure(format!(
                "read sector {sector} of {}",
                self.sectors
            ))));
        }
        let data = self.data.lock();
        let start = sector as usize * SECTOR_SIZE;
        buf.copy_from_slice(&data[start..start + SECTOR_SIZE]);
        Ok(())
    }

    fn write(&self, sector: SectorId, buf: &[u8]) -> Result<()> {
        if sector >= self.sectors || buf.len() != SECTOR_SIZE {
            return Err(anyhow!(Error::IoFailure(format!(
                "write sector {sector} of {}",
                self.sectors
            ))));
        }
        let mut data = self.data.lock();
        let start = sector as usize * SECTOR_SIZE;
        data[start..start + SECTOR_SIZE].copy_from_slice(buf);
        Ok(())
    }

    fn size(&self) -> u64 {
        self.sectors
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_write_then_read() -> Result<()> {
        let path = test_path();
        let disk = FileDisk::new(&path, 16)?;

        let mut sector = [0u8; SECTOR_SIZE];
        sector[0] = 0xAB;
        sector[SECTOR_SIZE - 1] = 0xCD;
        disk.write(7, &sector)?;

        let mut out = [0u8; SECTOR_SIZE];
        disk.read(7, &mut out)?;
        assert_eq!(out, sector);

        // untouched sectors read back as zeros
        disk.read(6, &mut out)?;
        assert_eq!(out, [0u8; SECTOR_SIZE]);

        std::fs::remove_file(path)?;

        Ok(())
    }

    #[test]
    fn test_out_of_range_rejected() {
        let disk = MemDisk::new(4);
        let mut buf = [0u8; SECTOR_SIZE];
        assert!(disk.read(4, &mut buf).is_err());
        assert!(disk.write(4, &buf).is_err());

        let mut short = [0u8; 8];
        assert!(disk.read(0, &mut short).is_err());
    }

    #[test]
    fn test_mem_disk_round_trip() -> Result<()> {
        let disk = MemDisk::new(8);
        let buf = [0x5Au8; SECTOR_SIZE];
        disk.write(3, &buf)?;
        let mut out = [0u8; SECTOR_SIZE];
        disk.read(3, &mut out)?;
        assert_eq!(out, buf);
        Ok(())
    }
}
