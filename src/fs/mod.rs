use crate::cache::DiskCache;
use crate::disk_manager::{SectorId, SECTOR_SIZE};
use anyhow::Result;
use parking_lot::RwLock;
use std::sync::Arc;

/// The slice of the file layer the VM core consumes: positionless byte I/O
/// plus `reopen`, which hands out an independent handle over the same bytes
/// (mmap needs one so cursor state elsewhere cannot interfere).
pub trait FileHandle: Send + Sync {
    /// Read up to `buf.len()` bytes at `offset`; returns the bytes read.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize>;
    /// Write up to `buf.len()` bytes at `offset`; returns the bytes
    /// written. Writes never grow the file.
    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize>;
    fn len(&self) -> u64;
    fn is_empty(&self) -> bool {
        self.len() == 0
    }
    fn reopen(&self) -> Arc<dyn FileHandle>;
}

/// Shared in-memory file.
pub struct MemFile {
    bytes: Arc<RwLock<Vec<u8>>>,
}

impl MemFile {
    pub fn new(len: u64) -> Self {
        Self {
            bytes: Arc::new(RwLock::new(vec![0u8; len as usize])),
        }
    }

    pub fn from_bytes(bytes: Vec<u8>) -> Self {
        Self {
            bytes: Arc::new(RwLock::new(bytes)),
        }
    }
}

impl FileHandle for MemFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let bytes = self.bytes.read();
        if offset >= bytes.len() as u64 {
            return Ok(0);
        }
        let start = offset as usize;
        let n = buf.len().min(bytes.len() - start);
        buf[..n].copy_from_slice(&bytes[start..start + n]);
        Ok(n)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize> {
        let mut bytes = self.bytes.write();
        if offset >= bytes.len() as u64 {
            return Ok(0);
        }
        let start = offset as usize;
        let n = buf.len().min(bytes.len() - start);
        bytes[start..start + n].copy_from_slice(&buf[..n]);
        Ok(n)
    }

    fn len(&self) -> u64 {
        self.bytes.read().len() as u64
    }

    fn reopen(&self) -> Arc<dyn FileHandle> {
        Arc::new(MemFile {
            bytes: self.bytes.clone(),
        })
    }
}

/// Byte-granular file over a contiguous run of sectors of a [`DiskCache`].
/// Every access goes through the cache, so repeated reads hit memory and
/// writes ride the cache's write-back path.
pub struct CachedFile {
    cache: Arc<DiskCache>,
    start: SectorId,
    len: u64,
}

impl CachedFile {
    pub fn new(cache: Arc<DiskCache>, start: SectorId, len: u64) -> Self {
        Self { cache, start, len }
    }
}

impl FileHandle for CachedFile {
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> Result<usize> {
        if offset >= self.len {
            return Ok(0);
        }
        let total = buf.len().min((self.len - offset) as usize);
        let mut done = 0;
        while done < total {
            let pos = offset + done as u64;
            let sector = self.start + pos / SECTOR_SIZE as u64;
            let within = (pos % SECTOR_SIZE as u64) as usize;
            let chunk = (SECTOR_SIZE - within).min(total - done);
            self.cache
                .read(sector, within, &mut buf[done..done + chunk])?;
            done += chunk;
        }
        Ok(total)
    }

    fn write_at(&self, offset: u64, buf: &[u8]) -> Result<usize> {
        if offset >= self.len {
            return Ok(0);
        }
        let total = buf.len().min((self.len - offset) as usize);
        let mut done = 0;
        while done < total {
            let pos = offset + done as u64;
            let sector = self.start + pos / SECTOR_SIZE as u64;
            let within = (pos % SECTOR_SIZE as u64) as usize;
            let chunk = (SECTOR_SIZE - within).min(total - done);
            self.cache.write(sector, within, &buf[done..done + chunk])?;
            done += chunk;
        }
        Ok(total)
    }

    fn len(&self) -> u64 {
        self.len
    }

    fn reopen(&self) -> Arc<dyn FileHandle> {
        Arc::new(CachedFile {
            cache: self.cache.clone(),
            start: self.start,
            len: self.len,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::disk_manager::MemDisk;

    #[test]
    fn test_mem_file_clamps_to_length() -> Result<()> {
        let file = MemFile::new(10);
        assert_eq!(file.write_at(6, &[1, 2, 3, 4, 5, 6])?, 4);
        assert_eq!(file.write_at(10, &[9])?, 0);

        let mut out = [0u8; 8];
        assert_eq!(file.read_at(6, &mut out)?, 4);
        assert_eq!(&out[..4], &[1, 2, 3, 4]);
        Ok(())
    }

    #[test]
    fn test_reopen_shares_bytes() -> Result<()> {
        let file = MemFile::new(4);
        let other = file.reopen();
        file.write_at(0, &[7, 7, 7, 7])?;

        let mut out = [0u8; 4];
        other.read_at(0, &mut out)?;
        assert_eq!(out, [7, 7, 7, 7]);
        Ok(())
    }

    #[test]
    fn test_cached_file_crosses_sector_boundaries() -> Result<()> {
        let cache = Arc::new(DiskCache::new(Arc::new(MemDisk::new(64))));
        let file = CachedFile::new(cache, 4, 3 * SECTOR_SIZE as u64);

        let data = (0..1000).map(|i| (i % 255) as u8).collect::<Vec<_>>();
        assert_eq!(file.write_at(200, &data)?, 1000);

        let mut out = vec![0u8; 1000];
        assert_eq!(file.read_at(200, &mut out)?, 1000);
        assert_eq!(out, data);
        Ok(())
    }

    #[test]
    fn test_cached_file_write_clamped() -> Result<()> {
        let cache = Arc::new(DiskCache::new(Arc::new(MemDisk::new(16))));
        let file = CachedFile::new(cache, 0, 100);

        assert_eq!(file.write_at(90, &[1u8; 50])?, 10);
        assert_eq!(file.read_at(120, &mut [0u8; 4])?, 0);
        Ok(())
    }
}
