//! C8: the extent resolver. `Inode::get_block` maps a logical block number
//! to a physical block (or a hole) via a single-slot, mutex-guarded cache
//! backed by a `CAT`/`LE` catalog query. `ApfsForkReader` and
//! `read_file_data` are host-facing conveniences built on top of it.

use std::io::{Read, Seek, SeekFrom, Write};
use std::sync::{Arc, Mutex};

use crate::btree::Table;
use crate::catalog;
use crate::error::{ApfsError, Result};
use crate::object::Device;

/// The outcome of resolving one logical block: either a physical block plus
/// the number of contiguous bytes available from it, or a hole of that many
/// zero bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Mapping {
    Physical(u64, u64),
    Hole(u64),
}

#[derive(Debug, Clone, Copy)]
struct CachedExtent {
    logical_addr: u64,
    phys_block_num: u64,
    len: u64,
}

/// Single-slot, mutex-guarded cache of the most recently resolved extent for
/// one inode. Held only across the compare/write-back, never across a B-tree
/// query.
#[derive(Default)]
struct ExtentCache(Mutex<Option<CachedExtent>>);

impl ExtentCache {
    fn lookup(&self, iaddr: u64) -> Option<CachedExtent> {
        let guard = self.0.lock().unwrap();
        match *guard {
            Some(c) if iaddr >= c.logical_addr && iaddr < c.logical_addr + c.len => Some(c),
            _ => None,
        }
    }

    fn store(&self, entry: CachedExtent) {
        *self.0.lock().unwrap() = Some(entry);
    }
}

/// A file's extent-resolution handle: everything `get_block` needs, without
/// holding the device lock or a catalog query open between calls.
pub struct Inode<R: Read + Seek> {
    device: Arc<Mutex<Device<R>>>,
    catalog_root: Table,
    omap_root: Table,
    block_size: u32,
    /// The `FILE_EXTENT` records' object id (the inode's `private_id`).
    extent_id: u64,
    cache: ExtentCache,
}

impl<R: Read + Seek> Inode<R> {
    pub fn new(
        device: Arc<Mutex<Device<R>>>,
        catalog_root: Table,
        omap_root: Table,
        block_size: u32,
        extent_id: u64,
    ) -> Self {
        Inode {
            device,
            catalog_root,
            omap_root,
            block_size,
            extent_id,
            cache: ExtentCache::default(),
        }
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    fn mapping_from(&self, c: &CachedExtent, iblock: u64) -> Mapping {
        let block_bits = self.block_size.trailing_zeros();
        let blk_off = iblock - (c.logical_addr >> block_bits);
        let remaining_bytes = c.len - blk_off * self.block_size as u64;
        if c.phys_block_num == 0 {
            Mapping::Hole(remaining_bytes)
        } else {
            Mapping::Physical(c.phys_block_num + blk_off, remaining_bytes)
        }
    }

    /// Resolve the logical block `iblock` to a physical block or a hole,
    /// reporting the run of contiguous bytes available under the same
    /// extent.
    pub fn get_block(&self, iblock: u64) -> Result<Mapping> {
        let iaddr = iblock * self.block_size as u64;

        if let Some(c) = self.cache.lookup(iaddr) {
            return Ok(self.mapping_from(&c, iblock));
        }

        let found = {
            let mut device = self.device.lock().unwrap();
            catalog::lookup_extent_at(
                &mut device,
                &self.catalog_root,
                &self.omap_root,
                self.extent_id,
                iaddr,
            )?
        };

        let (logical_addr, extent) = found.ok_or(ApfsError::NotFound)?;
        let len = extent.length();
        if len % self.block_size as u64 != 0 {
            log::error!(
                "extent length {len} for oid {} is not a multiple of block size {}",
                self.extent_id,
                self.block_size
            );
            return Err(ApfsError::CorruptedData(format!(
                "extent length {len} misaligned to block size {}",
                self.block_size
            )));
        }

        let cached = CachedExtent { logical_addr, phys_block_num: extent.phys_block_num, len };
        self.cache.store(cached);
        Ok(self.mapping_from(&cached, iblock))
    }

    fn read_one_block(&self, block_number: u64) -> Result<crate::object::Buffer> {
        self.device.lock().unwrap().read_block(block_number)
    }
}


/// A reader that presents a file's extents as a contiguous `Read + Seek`
/// stream, resolving each block lazily through `Inode::get_block`.
pub struct ApfsForkReader<R: Read + Seek> {
    inode: Inode<R>,
    logical_size: u64,
    position: u64,
}

impl<R: Read + Seek> ApfsForkReader<R> {
    pub fn new(inode: Inode<R>, logical_size: u64) -> Self {
        ApfsForkReader { inode, logical_size, position: 0 }
    }
}

impl<R: Read + Seek> Read for ApfsForkReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if self.position >= self.logical_size {
            return Ok(0);
        }

        let remaining = (self.logical_size - self.position) as usize;
        let to_read = buf.len().min(remaining);
        if to_read == 0 {
            return Ok(0);
        }

        let block_size = self.inode.block_size() as u64;
        let mut total = 0usize;

        while total < to_read {
            let logical_pos = self.position + total as u64;
            let iblock = logical_pos / block_size;
            let in_block_off = (logical_pos % block_size) as usize;

            let mapping = self
                .inode
                .get_block(iblock)
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;

            let chunk = (block_size as usize - in_block_off).min(to_read - total);

            match mapping {
                Mapping::Physical(bno, _) => {
                    let block = self
                        .inode
                        .read_one_block(bno)
                        .map_err(|e| std::io::Error::new(std::io::ErrorKind::Other, e))?;
                    buf[total..total + chunk]
                        .copy_from_slice(&block.as_slice()[in_block_off..in_block_off + chunk]);
                }
                Mapping::Hole(_) => {
                    buf[total..total + chunk].fill(0);
                }
            }

            total += chunk;
        }

        self.position += total as u64;
        Ok(total)
    }
}

impl<R: Read + Seek> Seek for ApfsForkReader<R> {
    fn seek(&mut self, pos: SeekFrom) -> std::io::Result<u64> {
        let new_pos = match pos {
            SeekFrom::Start(offset) => offset as i64,
            SeekFrom::Current(offset) => self.position as i64 + offset,
            SeekFrom::End(offset) => self.logical_size as i64 + offset,
        };

        if new_pos < 0 {
            return Err(std::io::Error::new(
                std::io::ErrorKind::InvalidInput,
                "seek before start of file",
            ));
        }

        self.position = new_pos as u64;
        Ok(self.position)
    }
}

/// Read a file's full contents via `get_block`, streaming to `writer`.
/// Returns the number of bytes written.
pub fn read_file_data<R: Read + Seek, W: Write>(
    inode: &Inode<R>,
    logical_size: u64,
    writer: &mut W,
) -> Result<u64> {
    if logical_size == 0 {
        return Ok(0);
    }

    let block_size = inode.block_size() as u64;
    let mut written = 0u64;

    while written < logical_size {
        let iblock = written / block_size;
        let in_block_off = (written % block_size) as usize;
        let mapping = inode.get_block(iblock)?;
        let chunk = (block_size as usize - in_block_off).min((logical_size - written) as usize);

        match mapping {
            Mapping::Physical(bno, _) => {
                let block = inode.read_one_block(bno)?;
                writer.write_all(&block.as_slice()[in_block_off..in_block_off + chunk])?;
            }
            Mapping::Hole(_) => {
                writer.write_all(&vec![0u8; chunk])?;
            }
        }

        written += chunk as u64;
    }

    Ok(written)
}
