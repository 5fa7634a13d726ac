//! C3 (node reader) and C5 (B-tree query engine).
//!
//! A `Table` is one parsed B-tree node, reference-counted so that a
//! `QueryResult` can keep the leaf it matched alive without re-reading it.
//! `query` descends a root to a leaf via binary search (`QueryFlags::Exact`
//! for an exact match, `QueryFlags::Le` for the greatest record at or below
//! a key); `scan` walks every record in a subtree, used where the caller
//! wants every record in a bucket (directory listing, xattr enumeration,
//! the container omap walk for `statfs`) rather than a single point lookup.

use byteorder::{LittleEndian, ReadBytesExt};
use std::cmp::Ordering;
use std::io::{Cursor, Read, Seek};
use std::sync::Arc;

use crate::error::{ApfsError, Result};
use crate::object::{Device, ObjectHeader};

pub const BTNODE_ROOT: u16 = 0x0001;
pub const BTNODE_LEAF: u16 = 0x0002;
pub const BTNODE_FIXED_KV_SIZE: u16 = 0x0004;

#[derive(Debug, Clone)]
pub struct BTreeNodeHeader {
    pub btn_flags: u16,
    pub btn_level: u16,
    pub btn_nkeys: u32,
    pub btn_table_space_off: u16,
    pub btn_table_space_len: u16,
    pub btn_free_space_off: u16,
    pub btn_free_space_len: u16,
    pub btn_free_list_off: u16,
    pub btn_free_list_len: u16,
    pub btn_key_free_list_off: u16,
    pub btn_key_free_list_len: u16,
    pub btn_val_free_list_off: u16,
    pub btn_val_free_list_len: u16,
}

impl BTreeNodeHeader {
    pub const SIZE: usize = 24;

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(ApfsError::InvalidBTree("btree node header too short".into()));
        }
        let mut cursor = Cursor::new(data);
        Ok(BTreeNodeHeader {
            btn_flags: cursor.read_u16::<LittleEndian>()?,
            btn_level: cursor.read_u16::<LittleEndian>()?,
            btn_nkeys: cursor.read_u32::<LittleEndian>()?,
            btn_table_space_off: cursor.read_u16::<LittleEndian>()?,
            btn_table_space_len: cursor.read_u16::<LittleEndian>()?,
            btn_free_space_off: cursor.read_u16::<LittleEndian>()?,
            btn_free_space_len: cursor.read_u16::<LittleEndian>()?,
            btn_free_list_off: cursor.read_u16::<LittleEndian>()?,
            btn_free_list_len: cursor.read_u16::<LittleEndian>()?,
            btn_key_free_list_off: cursor.read_u16::<LittleEndian>()?,
            btn_key_free_list_len: cursor.read_u16::<LittleEndian>()?,
            btn_val_free_list_off: cursor.read_u16::<LittleEndian>()?,
            btn_val_free_list_len: cursor.read_u16::<LittleEndian>()?,
        })
    }

    pub fn is_leaf(&self) -> bool {
        self.btn_flags & BTNODE_LEAF != 0
    }

    pub fn is_root(&self) -> bool {
        self.btn_flags & BTNODE_ROOT != 0
    }

    pub fn is_fixed_kv(&self) -> bool {
        self.btn_flags & BTNODE_FIXED_KV_SIZE != 0
    }
}

/// 40-byte footer on a root node, after the value area.
#[derive(Debug, Clone)]
pub struct BTreeInfo {
    pub bt_flags: u32,
    pub bt_node_size: u32,
    pub bt_key_size: u32,
    pub bt_val_size: u32,
    pub bt_longest_key: u32,
    pub bt_longest_val: u32,
    pub bt_key_count: u64,
    pub bt_node_count: u64,
}

impl BTreeInfo {
    pub const SIZE: usize = 40;

    pub fn parse(data: &[u8]) -> Result<Self> {
        if data.len() < Self::SIZE {
            return Err(ApfsError::InvalidBTree("btree info too short".into()));
        }
        let mut cursor = Cursor::new(data);
        Ok(BTreeInfo {
            bt_flags: cursor.read_u32::<LittleEndian>()?,
            bt_node_size: cursor.read_u32::<LittleEndian>()?,
            bt_key_size: cursor.read_u32::<LittleEndian>()?,
            bt_val_size: cursor.read_u32::<LittleEndian>()?,
            bt_longest_key: cursor.read_u32::<LittleEndian>()?,
            bt_longest_val: cursor.read_u32::<LittleEndian>()?,
            bt_key_count: cursor.read_u64::<LittleEndian>()?,
            bt_node_count: cursor.read_u64::<LittleEndian>()?,
        })
    }
}

#[derive(Debug, Clone, Copy)]
struct TocEntry {
    key_off: u16,
    key_len: u16,
    val_off: u16,
    val_len: u16,
}

struct TableInner {
    header: ObjectHeader,
    node_header: BTreeNodeHeader,
    toc: Vec<TocEntry>,
    buffer: crate::object::Buffer,
    key_area_off: usize,
    val_area_end: usize,
    info: Option<BTreeInfo>,
}

/// A parsed B-tree node. Cheap to `Clone` — it shares the underlying
/// block buffer and parsed table-of-contents via `Arc`.
#[derive(Clone)]
pub struct Table(Arc<TableInner>);

impl Table {
    /// Read, checksum-verify, and parse the node at `block_number`.
    pub fn open<R: Read + Seek>(device: &mut Device<R>, block_number: u64) -> Result<Self> {
        let (header, buffer) = device.read_object(block_number)?;
        Self::from_parts(header, buffer)
    }

    fn from_parts(header: ObjectHeader, buffer: crate::object::Buffer) -> Result<Self> {
        let block = buffer.as_slice();
        let node_header = BTreeNodeHeader::parse(&block[ObjectHeader::SIZE..]).map_err(|e| {
            log::error!("malformed btree node at block {}: {e}", buffer.block_number());
            e
        })?;

        let toc_start =
            ObjectHeader::SIZE + BTreeNodeHeader::SIZE + node_header.btn_table_space_off as usize;
        let fixed_kv = node_header.is_fixed_kv();

        let key_area_off = ObjectHeader::SIZE
            + BTreeNodeHeader::SIZE
            + node_header.btn_table_space_off as usize
            + node_header.btn_table_space_len as usize;

        let info = if node_header.is_root() {
            if block.len() < BTreeInfo::SIZE {
                return Err(ApfsError::InvalidBTree("root node too short for footer".into()));
            }
            Some(BTreeInfo::parse(&block[block.len() - BTreeInfo::SIZE..])?)
        } else {
            None
        };

        let val_area_end = if node_header.is_root() {
            block.len() - BTreeInfo::SIZE
        } else {
            block.len()
        };

        if toc_start > block.len() {
            return Err(ApfsError::InvalidBTree("toc offset out of bounds".into()));
        }

        let mut toc = Vec::with_capacity(node_header.btn_nkeys as usize);
        let mut cursor = Cursor::new(&block[toc_start..]);
        for _ in 0..node_header.btn_nkeys {
            if fixed_kv {
                let key_off = cursor.read_u16::<LittleEndian>()?;
                let val_off = cursor.read_u16::<LittleEndian>()?;
                toc.push(TocEntry { key_off, key_len: 0, val_off, val_len: 0 });
            } else {
                let key_off = cursor.read_u16::<LittleEndian>()?;
                let key_len = cursor.read_u16::<LittleEndian>()?;
                let val_off = cursor.read_u16::<LittleEndian>()?;
                let val_len = cursor.read_u16::<LittleEndian>()?;
                toc.push(TocEntry { key_off, key_len, val_off, val_len });
            }
        }

        Ok(Table(Arc::new(TableInner {
            header,
            node_header,
            toc,
            buffer,
            key_area_off,
            val_area_end,
            info,
        })))
    }

    pub fn records(&self) -> usize {
        self.0.toc.len()
    }

    pub fn is_leaf(&self) -> bool {
        self.0.node_header.is_leaf()
    }

    pub fn level(&self) -> u16 {
        self.0.node_header.btn_level
    }

    pub fn block_number(&self) -> u64 {
        self.0.buffer.block_number()
    }

    pub fn raw(&self) -> &[u8] {
        self.0.buffer.as_slice()
    }

    pub fn object_header(&self) -> &ObjectHeader {
        &self.0.header
    }

    /// Effective fixed key/value sizes: a root node's footer overrides the
    /// caller-supplied defaults when present and nonzero.
    fn effective_sizes(&self, fixed_key_size: u32, fixed_val_size: u32) -> (u32, u32) {
        match &self.0.info {
            Some(info) => (
                if info.bt_key_size > 0 { info.bt_key_size } else { fixed_key_size },
                if info.bt_val_size > 0 { info.bt_val_size } else { fixed_val_size },
            ),
            None => (fixed_key_size, fixed_val_size),
        }
    }

    pub fn locate_key(&self, index: usize, fixed_key_size: u32) -> Result<(usize, usize)> {
        let entry = self
            .0
            .toc
            .get(index)
            .ok_or_else(|| ApfsError::InvalidBTree(format!("record index {index} out of range")))?;
        let start = self.0.key_area_off + entry.key_off as usize;
        let len = if self.0.node_header.is_fixed_kv() {
            fixed_key_size as usize
        } else {
            entry.key_len as usize
        };
        let end = start + len;
        if end > self.raw().len() {
            return Err(ApfsError::InvalidBTree(format!(
                "key out of bounds: start={start}, len={len}, block_size={}",
                self.raw().len()
            )));
        }
        Ok((start, end))
    }

    pub fn locate_value(&self, index: usize, fixed_val_size: u32) -> Result<(usize, usize)> {
        let entry = self
            .0
            .toc
            .get(index)
            .ok_or_else(|| ApfsError::InvalidBTree(format!("record index {index} out of range")))?;
        let len = if !self.0.node_header.is_leaf() {
            8 // internal node values are always an oid_t
        } else if self.0.node_header.is_fixed_kv() {
            fixed_val_size as usize
        } else {
            entry.val_len as usize
        };

        let val_off = entry.val_off as usize;
        if val_off > self.0.val_area_end {
            return Err(ApfsError::InvalidBTree("value offset out of bounds".into()));
        }
        let start = self.0.val_area_end - val_off;
        let end = start + len;
        if end > self.raw().len() || start < self.0.key_area_off {
            return Err(ApfsError::InvalidBTree(format!(
                "value out of bounds: start={start}, len={len}, val_area_end={}",
                self.0.val_area_end
            )));
        }
        Ok((start, end))
    }

    pub fn key(&self, index: usize, fixed_key_size: u32) -> Result<&[u8]> {
        let (s, e) = self.locate_key(index, fixed_key_size)?;
        Ok(&self.raw()[s..e])
    }

    pub fn value(&self, index: usize, fixed_val_size: u32) -> Result<&[u8]> {
        let (s, e) = self.locate_value(index, fixed_val_size)?;
        Ok(&self.raw()[s..e])
    }

    pub fn child_oid(&self, index: usize) -> Result<u64> {
        let val = self.value(index, 8)?;
        if val.len() < 8 {
            return Err(ApfsError::InvalidBTree("child oid too short".into()));
        }
        Ok(u64::from_le_bytes(val[..8].try_into().unwrap()))
    }
}

/// Whether a query matches a single key exactly, or the greatest key at or
/// below it (used for both OMAP newest-version lookups and file-extent
/// "which extent covers this offset" lookups).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryFlags {
    Exact,
    Le,
}

/// The located record: the leaf `Table` (kept alive for as long as the
/// result lives) plus the byte ranges of the matched key and value.
pub struct QueryResult {
    pub table: Table,
    pub index: usize,
    key_range: (usize, usize),
    val_range: (usize, usize),
}

impl QueryResult {
    pub fn key(&self) -> &[u8] {
        &self.table.raw()[self.key_range.0..self.key_range.1]
    }

    pub fn value(&self) -> &[u8] {
        &self.table.raw()[self.val_range.0..self.val_range.1]
    }
}

/// Rightmost index `i` with `cmp(key(i)) != Greater`, i.e. the greatest key
/// at or below the target — used both to pick an internal node's child and
/// to answer an `Le` leaf query.
fn lower_bound_le(
    node: &Table,
    fixed_key_size: u32,
    cmp: &dyn Fn(&[u8]) -> Ordering,
) -> Result<Option<usize>> {
    let n = node.records();
    if n == 0 {
        return Ok(None);
    }
    let mut lo: i64 = 0;
    let mut hi: i64 = n as i64 - 1;
    let mut found: Option<usize> = None;
    while lo <= hi {
        let mid = lo + (hi - lo) / 2;
        let key = node.key(mid as usize, fixed_key_size)?;
        match cmp(key) {
            Ordering::Greater => hi = mid - 1,
            _ => {
                found = Some(mid as usize);
                lo = mid + 1;
            }
        }
    }
    Ok(found)
}

/// Binary search for an exact match; unlike `lower_bound_le`, a `Less`
/// result narrows the search upward instead of recording a candidate.
fn binary_search_equal(
    node: &Table,
    fixed_key_size: u32,
    cmp: &dyn Fn(&[u8]) -> Ordering,
) -> Result<Option<usize>> {
    let n = node.records();
    let mut lo: i64 = 0;
    let mut hi: i64 = n as i64 - 1;
    while lo <= hi {
        let mid = lo + (hi - lo) / 2;
        let key = node.key(mid as usize, fixed_key_size)?;
        match cmp(key) {
            Ordering::Equal => return Ok(Some(mid as usize)),
            Ordering::Less => lo = mid + 1,
            Ordering::Greater => hi = mid - 1,
        }
    }
    Ok(None)
}

fn resolve_child<R: Read + Seek>(
    device: &mut Device<R>,
    child_oid: u64,
    omap_root: Option<&Table>,
) -> Result<u64> {
    match omap_root {
        Some(om) => crate::omap::omap_lookup(device, om, child_oid),
        None => Ok(child_oid),
    }
}

/// Descend `root` to a leaf and return the record selected by `flags`.
///
/// `omap_root`: `Some` for virtual B-trees (the catalog, whose child
/// pointers are virtual oids resolved through the volume omap); `None` for
/// physical B-trees (an omap's own tree, whose child pointers are already
/// physical block numbers).
pub fn query<R: Read + Seek>(
    device: &mut Device<R>,
    root: &Table,
    fixed_key_size: u32,
    fixed_val_size: u32,
    cmp: &dyn Fn(&[u8]) -> Ordering,
    flags: QueryFlags,
    omap_root: Option<&Table>,
) -> Result<QueryResult> {
    let (fks, fvs) = root.effective_sizes(fixed_key_size, fixed_val_size);
    query_node(device, root.clone(), fks, fvs, cmp, flags, omap_root)
}

fn query_node<R: Read + Seek>(
    device: &mut Device<R>,
    node: Table,
    fixed_key_size: u32,
    fixed_val_size: u32,
    cmp: &dyn Fn(&[u8]) -> Ordering,
    flags: QueryFlags,
    omap_root: Option<&Table>,
) -> Result<QueryResult> {
    if node.is_leaf() {
        let idx = match flags {
            QueryFlags::Exact => binary_search_equal(&node, fixed_key_size, cmp)?,
            QueryFlags::Le => lower_bound_le(&node, fixed_key_size, cmp)?,
        }
        .ok_or(ApfsError::NotFound)?;

        let key_range = node.locate_key(idx, fixed_key_size)?;
        let val_range = node.locate_value(idx, fixed_val_size)?;
        Ok(QueryResult { table: node, index: idx, key_range, val_range })
    } else {
        let idx = lower_bound_le(&node, fixed_key_size, cmp)?.ok_or(ApfsError::NotFound)?;
        let child_oid = node.child_oid(idx)?;
        let child_block = resolve_child(device, child_oid, omap_root)?;
        let child = Table::open(device, child_block)?;
        query_node(device, child, fixed_key_size, fixed_val_size, cmp, flags, omap_root)
    }
}

/// How a key relates to the bucket a `scan` is collecting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScanSignal {
    /// Before the bucket — keep scanning forward.
    Skip,
    /// Inside the bucket — collect this record.
    Take,
    /// Past the bucket — stop scanning entirely.
    Stop,
}

/// Collect every record for which `classify` returns `Take`, stopping as
/// soon as it returns `Stop`. Visits the whole subtree (APFS leaves carry no
/// sibling pointers to skip ahead with), so this is appropriate for bucket
/// enumeration (a directory's entries, a file's extents) rather than a
/// single-key lookup — use `query` for that.
pub fn scan<R: Read + Seek>(
    device: &mut Device<R>,
    root: &Table,
    fixed_key_size: u32,
    fixed_val_size: u32,
    classify: &dyn Fn(&[u8]) -> ScanSignal,
    omap_root: Option<&Table>,
) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
    let (fks, fvs) = root.effective_sizes(fixed_key_size, fixed_val_size);
    let mut out = Vec::new();
    scan_node(device, root, fks, fvs, classify, omap_root, &mut out)?;
    Ok(out)
}

fn scan_node<R: Read + Seek>(
    device: &mut Device<R>,
    node: &Table,
    fixed_key_size: u32,
    fixed_val_size: u32,
    classify: &dyn Fn(&[u8]) -> ScanSignal,
    omap_root: Option<&Table>,
    out: &mut Vec<(Vec<u8>, Vec<u8>)>,
) -> Result<bool> {
    if node.is_leaf() {
        for i in 0..node.records() {
            let key = node.key(i, fixed_key_size)?;
            match classify(key) {
                ScanSignal::Take => {
                    let val = node.value(i, fixed_val_size)?;
                    out.push((key.to_vec(), val.to_vec()));
                }
                ScanSignal::Skip => continue,
                ScanSignal::Stop => return Ok(false),
            }
        }
        Ok(true)
    } else {
        for i in 0..node.records() {
            let child_oid = node.child_oid(i)?;
            let child_block = resolve_child(device, child_oid, omap_root)?;
            let child = Table::open(device, child_block)?;
            if !scan_node(device, &child, fixed_key_size, fixed_val_size, classify, omap_root, out)? {
                return Ok(false);
            }
        }
        Ok(true)
    }
}
