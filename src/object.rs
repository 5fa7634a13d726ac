//! C1 (checksum) consumer, object header parsing, and the C2 block I/O
//! adapter (`Device`).

use byteorder::{LittleEndian, ReadBytesExt};
use std::io::{Cursor, Read, Seek, SeekFrom};
use std::sync::Arc;

use crate::error::{ApfsError, Result};
use crate::fletcher;

// Object type constants (lower 16 bits of type_and_flags)
pub const OBJECT_TYPE_NX_SUPERBLOCK: u32 = 0x01;
pub const OBJECT_TYPE_BTREE: u32 = 0x02;
pub const OBJECT_TYPE_BTREE_NODE: u32 = 0x03;
pub const OBJECT_TYPE_SPACEMAN: u32 = 0x05;
pub const OBJECT_TYPE_OMAP: u32 = 0x0B;
pub const OBJECT_TYPE_CHECKPOINT_MAP: u32 = 0x0C;
pub const OBJECT_TYPE_FS: u32 = 0x0D;

// Object flag masks (upper 16 bits of type_and_flags)
pub const OBJ_PHYSICAL: u32 = 0x0000_0000;
pub const OBJ_VIRTUAL: u32 = 0x8000_0000;
pub const OBJ_EPHEMERAL: u32 = 0x4000_0000;
pub const OBJ_STORAGE_TYPE_MASK: u32 = 0xC000_0000;
pub const OBJECT_TYPE_MASK: u32 = 0x0000_FFFF;

/// Default block size used for the very first read of block 0, before the
/// container superblock's authoritative size is known.
pub const NX_DEFAULT_BLOCK_SIZE: u32 = 4096;

/// 32-byte header present on every APFS on-disk object. All fields little-endian.
#[derive(Debug, Clone)]
pub struct ObjectHeader {
    pub checksum: u64,
    pub oid: u64,
    pub xid: u64,
    pub type_and_flags: u32,
    pub subtype: u32,
}

impl ObjectHeader {
    pub const SIZE: usize = 32;

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(ApfsError::CorruptedData(format!(
                "object header too short: {} bytes",
                data.len()
            )));
        }

        let mut cursor = Cursor::new(data);
        Ok(ObjectHeader {
            checksum: cursor.read_u64::<LittleEndian>()?,
            oid: cursor.read_u64::<LittleEndian>()?,
            xid: cursor.read_u64::<LittleEndian>()?,
            type_and_flags: cursor.read_u32::<LittleEndian>()?,
            subtype: cursor.read_u32::<LittleEndian>()?,
        })
    }

    pub fn object_type(&self) -> u32 {
        self.type_and_flags & OBJECT_TYPE_MASK
    }

    pub fn storage_type(&self) -> u32 {
        self.type_and_flags & OBJ_STORAGE_TYPE_MASK
    }

    pub fn is_physical(&self) -> bool {
        self.storage_type() == OBJ_PHYSICAL
    }
}

/// An immutable, reference-counted physical block. Cheap to `Clone`; the
/// underlying bytes are released once the last clone drops.
#[derive(Debug, Clone)]
pub struct Buffer {
    bno: u64,
    data: Arc<[u8]>,
}

impl Buffer {
    pub fn block_number(&self) -> u64 {
        self.bno
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.data
    }
}

impl std::ops::Deref for Buffer {
    type Target = [u8];
    fn deref(&self) -> &[u8] {
        &self.data
    }
}

/// The C2 block I/O adapter: owns the host reader and the current block
/// size, and fetches reference-counted buffers for physical block numbers.
pub struct Device<R: Read + Seek> {
    reader: R,
    block_size: u32,
}

impl<R: Read + Seek> Device<R> {
    pub fn new(reader: R, block_size: u32) -> Self {
        Device { reader, block_size }
    }

    pub fn block_size(&self) -> u32 {
        self.block_size
    }

    pub fn set_block_size(&mut self, n: u32) {
        self.block_size = n;
    }

    /// Fetch a reference-counted buffer for a physical block number, without
    /// checksum verification.
    pub fn read_block(&mut self, block_number: u64) -> Result<Buffer> {
        let offset = block_number * self.block_size as u64;
        self.reader.seek(SeekFrom::Start(offset))?;

        let mut block = Vec::new();
        block
            .try_reserve_exact(self.block_size as usize)
            .map_err(|e| ApfsError::AllocFailed(e.to_string()))?;
        block.resize(self.block_size as usize, 0);
        self.reader.read_exact(&mut block)?;

        Ok(Buffer {
            bno: block_number,
            data: block.into(),
        })
    }

    /// Fetch a block, verify its Fletcher-64 checksum, and parse its header.
    pub fn read_object(&mut self, block_number: u64) -> Result<(ObjectHeader, Buffer)> {
        let buf = self.read_block(block_number)?;
        if !fletcher::verify_checksum(&buf) {
            log::error!("checksum mismatch at block {block_number}");
            return Err(ApfsError::InvalidChecksum);
        }
        let header = ObjectHeader::parse(&buf)?;
        Ok((header, buf))
    }

    pub fn into_inner(self) -> R {
        self.reader
    }
}
