//! Full-stack scenarios: user accesses driving faults, faults driving the
//! frame clock, evictions draining into swap and mmap files, and file I/O
//! riding the buffered disk cache.

use crate::cache::DiskCache;
use crate::context::VmContext;
use crate::disk_manager::{BlockDevice, MemDisk, SECTOR_SIZE};
use crate::fs::{CachedFile, FileHandle};
use crate::pages::PAGE_SIZE;
use anyhow::Result;
use std::sync::Arc;

fn small_ctx(frames: usize) -> VmContext {
    VmContext::new(frames, Arc::new(MemDisk::new(1024)))
}

#[test]
fn test_mmap_over_cached_file_reaches_device() -> Result<()> {
    let device = Arc::new(MemDisk::new(256));
    let cache = Arc::new(DiskCache::new(device.clone()));
    let file: Arc<dyn FileHandle> = Arc::new(CachedFile::new(cache.clone(), 8, 2000));

    let ctx = small_ctx(3);
    let pid = ctx.create_process();
    ctx.mmap(pid, file.clone(), 0x100000, 2000, true)?;
    ctx.write_user(pid, 0x100000 + 1500, &[0xAB, 0xCD])?;

    // crowd the mapped page out of the two usable frames
    for vaddr in [0x200000u64, 0x201000] {
        ctx.map_zero(pid, vaddr, true)?;
        ctx.write_user(pid, vaddr, &[1])?;
    }

    // the eviction flushed through the file layer into the cache
    let mut out = [0u8; 2];
    assert_eq!(file.read_at(1500, &mut out)?, 2);
    assert_eq!(out, [0xAB, 0xCD]);

    // byte 1500 of the file lives 476 bytes into its third sector
    ctx.munmap(pid, 0x100000, 2000)?;
    cache.flush_all()?;
    let mut sector = [0u8; SECTOR_SIZE];
    device.read(8 + 2, &mut sector)?;
    assert_eq!(sector[476], 0xAB);
    assert_eq!(sector[477], 0xCD);
    Ok(())
}

#[test]
fn test_segment_load_through_cache() -> Result<()> {
    let device = Arc::new(MemDisk::new(64));
    for sector in 20..24u64 {
        let mut content = [0u8; SECTOR_SIZE];
        for (i, byte) in content.iter_mut().enumerate() {
            *byte = (sector as usize * 31 + i) as u8;
        }
        device.write(sector, &content)?;
    }
    let cache = Arc::new(DiskCache::new(device.clone()));
    let file: Arc<dyn FileHandle> = Arc::new(CachedFile::new(cache, 20, 4 * SECTOR_SIZE as u64));

    let ctx = small_ctx(8);
    let pid = ctx.create_process();
    ctx.map_segment(pid, file.clone(), 100, 0x10000, false, 500)?;

    let mut via_vm = [0u8; 500];
    ctx.read_user(pid, 0x10000, &mut via_vm)?;
    let mut via_file = [0u8; 500];
    assert_eq!(file.read_at(100, &mut via_file)?, 500);
    assert_eq!(via_vm[..], via_file[..]);
    Ok(())
}

#[test]
fn test_munmap_then_remap_sees_other_process_writes() -> Result<()> {
    let device = Arc::new(MemDisk::new(64));
    let cache = Arc::new(DiskCache::new(device));
    let file: Arc<dyn FileHandle> = Arc::new(CachedFile::new(cache, 0, 512));

    let ctx = small_ctx(8);
    let writer = ctx.create_process();
    ctx.mmap(writer, file.clone(), 0x30000, 512, true)?;
    ctx.write_user(writer, 0x30000 + 17, &[0x99])?;
    ctx.munmap(writer, 0x30000, 512)?;

    let reader = ctx.create_process();
    ctx.mmap(reader, file, 0x30000, 512, false)?;
    let mut out = [0u8; 1];
    ctx.read_user(reader, 0x30000 + 17, &mut out)?;
    assert_eq!(out[0], 0x99);

    ctx.munmap(reader, 0x30000, 512)?;
    ctx.destroy_process(writer)?;
    ctx.destroy_process(reader)?;
    Ok(())
}

#[test]
fn test_heavy_swap_churn_keeps_pages_intact() -> Result<()> {
    // two usable frames, eight live pages: constant swap traffic
    let ctx = small_ctx(3);
    let pid = ctx.create_process();

    let base = 0x400000u64;
    let pattern = |i: u64, j: usize| (i as u8).wrapping_mul(37).wrapping_add(j as u8);

    for i in 0..8u64 {
        let vaddr = base + i * PAGE_SIZE as u64;
        ctx.map_zero(pid, vaddr, true)?;
        let bytes = (0..64).map(|j| pattern(i, j)).collect::<Vec<_>>();
        ctx.write_user(pid, vaddr, &bytes)?;
    }

    // several passes in both directions
    for round in 0..3 {
        for i in 0..8u64 {
            let i = if round % 2 == 0 { i } else { 7 - i };
            let vaddr = base + i * PAGE_SIZE as u64;
            let mut out = [0u8; 64];
            ctx.read_user(pid, vaddr, &mut out)?;
            for (j, byte) in out.iter().enumerate() {
                assert_eq!(*byte, pattern(i, j), "page {i} byte {j}");
            }
        }
    }

    ctx.destroy_process(pid)?;
    assert_eq!(ctx.frames_used(), ctx.table_overhead());
    Ok(())
}
