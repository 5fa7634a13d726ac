//! C4: catalog and omap search-key construction and the on-disk total
//! order used to drive B-tree descent (`btree::query`/`btree::scan`).

use std::cmp::Ordering;

use crate::btree::ScanSignal;
use crate::error::{ApfsError, Result};

// Catalog record types (j_obj_types), stored in the top 4 bits of the
// key's obj_id_and_type word.
pub const J_TYPE_SNAP_METADATA: u8 = 1;
pub const J_TYPE_EXTENT: u8 = 2;
pub const J_TYPE_INODE: u8 = 3;
pub const J_TYPE_XATTR: u8 = 4;
pub const J_TYPE_SIBLING_LINK: u8 = 5;
pub const J_TYPE_DSTREAM_ID: u8 = 6;
pub const J_TYPE_CRYPTO_STATE: u8 = 7;
pub const J_TYPE_FILE_EXTENT: u8 = 8;
pub const J_TYPE_DIR_REC: u8 = 9;
pub const J_TYPE_DIR_STATS: u8 = 10;
pub const J_TYPE_SNAP_NAME: u8 = 11;
pub const J_TYPE_SIBLING_MAP: u8 = 12;

const OBJ_ID_MASK: u64 = 0x0FFF_FFFF_FFFF_FFFF;
const OBJ_TYPE_SHIFT: u32 = 60;

/// `(virtual_oid, transaction_id)` — an object map key. Sorted ascending by
/// oid, then ascending by xid.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct OmapKey {
    pub oid: u64,
    pub xid: u64,
}

impl OmapKey {
    pub const SIZE: usize = 16;

    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < Self::SIZE {
            return Err(ApfsError::InvalidBTree("omap key too short".into()));
        }
        Ok(OmapKey {
            oid: u64::from_le_bytes(bytes[0..8].try_into().unwrap()),
            xid: u64::from_le_bytes(bytes[8..16].try_into().unwrap()),
        })
    }

    /// A comparator for `btree::query`'s `Le` flag that finds the newest
    /// (highest-xid) mapping for `oid`: bounding the search by
    /// `(oid, u64::MAX)` and taking the greatest key at or below it lands on
    /// the highest xid recorded for that oid, since every key sharing `oid`
    /// sorts below that bound and no key for a different oid can.
    pub fn newest_version_cmp(oid: u64) -> impl Fn(&[u8]) -> Ordering {
        move |bytes: &[u8]| match OmapKey::decode(bytes) {
            Ok(k) => (k.oid, k.xid).cmp(&(oid, u64::MAX)),
            Err(_) => Ordering::Less,
        }
    }
}

/// The type-dependent discriminant that follows `(object_id, record_type)`
/// in a catalog key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Secondary {
    None,
    /// `FILE_EXTENT`: the logical byte address the extent starts at.
    LogicalAddr(u64),
    /// `DIR_REC`/`XATTR`: the packed name length + hash preceding the name
    /// bytes. Not usable for ordering without APFS's name-hash function, so
    /// buckets sharing `(oid, record_type)` are enumerated with `scan` and
    /// refined by exact name match rather than binary search.
    NameLenHash(u32),
}

/// `(object_id, record_type, secondary)` — a catalog key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CatalogKey {
    pub oid: u64,
    pub record_type: u8,
    pub secondary: Secondary,
}

impl CatalogKey {
    /// Decode the `(oid, record_type)` header and, where the type carries
    /// one, the secondary discriminant.
    pub fn decode(bytes: &[u8]) -> Result<Self> {
        if bytes.len() < 8 {
            return Err(ApfsError::InvalidBTree("catalog key too short".into()));
        }
        let obj_id_and_type = u64::from_le_bytes(bytes[0..8].try_into().unwrap());
        let oid = obj_id_and_type & OBJ_ID_MASK;
        let record_type = (obj_id_and_type >> OBJ_TYPE_SHIFT) as u8;

        let secondary = match record_type {
            J_TYPE_FILE_EXTENT => {
                if bytes.len() < 16 {
                    return Err(ApfsError::InvalidBTree("file extent key too short".into()));
                }
                Secondary::LogicalAddr(u64::from_le_bytes(bytes[8..16].try_into().unwrap()))
            }
            J_TYPE_DIR_REC | J_TYPE_XATTR => {
                if bytes.len() < 12 {
                    Secondary::None
                } else {
                    Secondary::NameLenHash(u32::from_le_bytes(bytes[8..12].try_into().unwrap()))
                }
            }
            _ => Secondary::None,
        };

        Ok(CatalogKey { oid, record_type, secondary })
    }

    /// Ordering by `(oid, record_type)` only — the prefix shared by every
    /// catalog key, sufficient to locate a bucket.
    fn bucket_cmp(&self, oid: u64, record_type: u8) -> Ordering {
        (self.oid, self.record_type).cmp(&(oid, record_type))
    }

    /// Comparator for an exact lookup with no secondary discriminant (e.g.
    /// `INODE` records, keyed uniquely by oid).
    pub fn exact_cmp(oid: u64, record_type: u8) -> impl Fn(&[u8]) -> Ordering {
        move |bytes: &[u8]| match CatalogKey::decode(bytes) {
            Ok(k) => k.bucket_cmp(oid, record_type),
            Err(_) => Ordering::Less,
        }
    }

    /// Comparator for a `FILE_EXTENT` `Le` query: the greatest extent whose
    /// `logical_addr` is at or below `addr` covers the requested offset.
    pub fn le_extent_cmp(oid: u64, addr: u64) -> impl Fn(&[u8]) -> Ordering {
        move |bytes: &[u8]| match CatalogKey::decode(bytes) {
            Ok(k) => match k.bucket_cmp(oid, J_TYPE_FILE_EXTENT) {
                Ordering::Equal => match k.secondary {
                    Secondary::LogicalAddr(a) => a.cmp(&addr),
                    _ => Ordering::Less,
                },
                ord => ord,
            },
            Err(_) => Ordering::Less,
        }
    }

    /// `ScanSignal` classifier collecting every record in the `(oid,
    /// record_type)` bucket, in catalog sort order (oid, then type).
    pub fn bucket_classify(oid: u64, record_type: u8) -> impl Fn(&[u8]) -> ScanSignal {
        move |bytes: &[u8]| match CatalogKey::decode(bytes) {
            Ok(k) => match k.bucket_cmp(oid, record_type) {
                Ordering::Less => ScanSignal::Skip,
                Ordering::Equal => ScanSignal::Take,
                Ordering::Greater => ScanSignal::Stop,
            },
            Err(_) => ScanSignal::Skip,
        }
    }
}
