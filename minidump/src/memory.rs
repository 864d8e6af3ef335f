//! Reading the memory of a process, live or dumped.
//!
//! [`MemoryReader`] is the capability the stack walker unwinds through. It is
//! implemented by the memory streams of a [`Minidump`](crate::Minidump), by
//! the owned [`MemoryMap`] of a [`ProcessSnapshot`](crate::ProcessSnapshot),
//! and by the capture backends of `minidump-writer`.

use std::fmt;
use std::ops::Range;

use scroll::{Endian, Pread};
use tracing::warn;

/// Errors reading memory through a [`MemoryReader`].
#[derive(Debug, thiserror::Error)]
pub enum MemoryReadError {
    #[error("{len} bytes at {address:#x} are not mapped")]
    NotMapped { address: u64, len: usize },
    #[error("permission denied reading {address:#x}")]
    PermissionDenied { address: u64 },
    #[error("the target process is gone")]
    ProcessGone,
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Something that can copy bytes out of a process address space.
pub trait MemoryReader {
    /// Fill `buf` with the bytes at `address`.
    ///
    /// Partial reads are errors: either all of `buf` is filled or none of it
    /// should be trusted.
    fn read_memory(&self, address: u64, buf: &mut [u8]) -> Result<(), MemoryReadError>;

    /// Whether at least one byte at `address` is readable.
    fn contains(&self, address: u64) -> bool {
        let mut byte = [0u8; 1];
        self.read_memory(address, &mut byte).is_ok()
    }

    /// The byte order integers are stored in.
    fn endian(&self) -> Endian {
        Endian::Little
    }

    fn read_u32(&self, address: u64) -> Option<u32> {
        let mut buf = [0u8; 4];
        self.read_memory(address, &mut buf).ok()?;
        buf.pread_with(0, self.endian()).ok()
    }

    fn read_u64(&self, address: u64) -> Option<u64> {
        let mut buf = [0u8; 8];
        self.read_memory(address, &mut buf).ok()?;
        buf.pread_with(0, self.endian()).ok()
    }

    /// Read a pointer of `width` bytes (4 or 8), widened to `u64`.
    fn read_pointer(&self, address: u64, width: u64) -> Option<u64> {
        match width {
            4 => self.read_u32(address).map(u64::from),
            _ => self.read_u64(address),
        }
    }
}

impl<M: MemoryReader + ?Sized> MemoryReader for &M {
    fn read_memory(&self, address: u64, buf: &mut [u8]) -> Result<(), MemoryReadError> {
        (**self).read_memory(address, buf)
    }

    fn endian(&self) -> Endian {
        (**self).endian()
    }
}

/// Copy `buf.len()` bytes at `address` out of a region that starts at `base`.
pub(crate) fn read_from_region(
    base: u64,
    bytes: &[u8],
    address: u64,
    buf: &mut [u8],
) -> Result<(), MemoryReadError> {
    let not_mapped = || MemoryReadError::NotMapped {
        address,
        len: buf.len(),
    };
    let start = address.checked_sub(base).ok_or_else(not_mapped)? as usize;
    let end = start.checked_add(buf.len()).ok_or_else(not_mapped)?;
    let src = bytes.get(start..end).ok_or_else(not_mapped)?;
    buf.copy_from_slice(src);
    Ok(())
}

/// One contiguous copy of process memory.
#[derive(Clone, PartialEq, Eq)]
pub struct MemoryRegion {
    pub base_address: u64,
    pub bytes: Vec<u8>,
}

impl MemoryRegion {
    pub fn end_address(&self) -> u64 {
        self.base_address.saturating_add(self.bytes.len() as u64)
    }

    pub fn range(&self) -> Range<u64> {
        self.base_address..self.end_address()
    }
}

impl fmt::Debug for MemoryRegion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MemoryRegion")
            .field("base_address", &format_args!("{:#x}", self.base_address))
            .field("len", &self.bytes.len())
            .finish()
    }
}

/// Ordered, non-overlapping ranges of captured memory.
///
/// Reads may span regions that touch end to end.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MemoryMap {
    regions: Vec<MemoryRegion>,
    endian: Endian,
}

impl Default for MemoryMap {
    fn default() -> Self {
        MemoryMap::with_endian(Endian::Little)
    }
}

impl MemoryMap {
    pub fn new() -> MemoryMap {
        MemoryMap::default()
    }

    /// An empty map whose integers are stored in `endian` byte order.
    pub fn with_endian(endian: Endian) -> MemoryMap {
        MemoryMap {
            regions: vec![],
            endian,
        }
    }

    /// Add a region of memory.
    ///
    /// Empty regions and regions overlapping one already present are
    /// dropped with a warning; returns whether the region was added.
    pub fn insert(&mut self, base_address: u64, bytes: Vec<u8>) -> bool {
        if bytes.is_empty() {
            warn!("ignoring empty memory region at {:#x}", base_address);
            return false;
        }
        let Some(end) = base_address.checked_add(bytes.len() as u64) else {
            warn!("memory region at {:#x} wraps the address space", base_address);
            return false;
        };
        let idx = self
            .regions
            .partition_point(|region| region.base_address < base_address);
        let overlaps_prev = idx > 0 && self.regions[idx - 1].end_address() > base_address;
        let overlaps_next = self
            .regions
            .get(idx)
            .is_some_and(|next| next.base_address < end);
        if overlaps_prev || overlaps_next {
            warn!(
                "memory region {:#x}..{:#x} overlaps an existing region, skipping",
                base_address, end
            );
            return false;
        }
        self.regions.insert(
            idx,
            MemoryRegion {
                base_address,
                bytes,
            },
        );
        true
    }

    /// The region holding `address`, if any.
    pub fn region_at(&self, address: u64) -> Option<&MemoryRegion> {
        let idx = self
            .regions
            .partition_point(|region| region.base_address <= address);
        let region = self.regions.get(idx.checked_sub(1)?)?;
        (address < region.end_address()).then_some(region)
    }

    pub fn contains(&self, address: u64) -> bool {
        self.region_at(address).is_some()
    }

    /// Iterate over the regions in address order.
    pub fn iter(&self) -> impl Iterator<Item = &MemoryRegion> {
        self.regions.iter()
    }

    pub fn len(&self) -> usize {
        self.regions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.regions.is_empty()
    }
}

impl MemoryReader for MemoryMap {
    fn read_memory(&self, address: u64, buf: &mut [u8]) -> Result<(), MemoryReadError> {
        let not_mapped = MemoryReadError::NotMapped {
            address,
            len: buf.len(),
        };
        let mut cursor = address;
        let mut rest = &mut buf[..];
        while !rest.is_empty() {
            let Some(region) = self.region_at(cursor) else {
                return Err(not_mapped);
            };
            let available = (region.end_address() - cursor) as usize;
            let (chunk, tail) = rest.split_at_mut(available.min(rest.len()));
            read_from_region(region.base_address, &region.bytes, cursor, chunk)?;
            cursor += chunk.len() as u64;
            rest = tail;
        }
        Ok(())
    }

    fn endian(&self) -> Endian {
        self.endian
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_insert_rejects_overlap() {
        let mut map = MemoryMap::new();
        assert!(map.insert(0x2000, vec![0; 0x100]));
        assert!(map.insert(0x1000, vec![1; 0x100]));
        assert!(!map.insert(0x20f0, vec![2; 0x20]));
        assert!(!map.insert(0x1ff0, vec![2; 0x20]));
        assert!(!map.insert(0x3000, vec![]));
        assert!(map.insert(0x2100, vec![3; 0x10]));
        let bases: Vec<_> = map.iter().map(|r| r.base_address).collect();
        assert_eq!(bases, vec![0x1000, 0x2000, 0x2100]);
    }

    #[test]
    fn test_region_lookup() {
        let mut map = MemoryMap::new();
        map.insert(0x1000, (0u8..16).collect());
        assert!(map.contains(0x1000));
        assert!(map.contains(0x100f));
        assert!(!map.contains(0x1010));
        assert!(!map.contains(0xfff));
        assert_eq!(map.read_u32(0x1004), Some(0x07060504));
        // Reads may not run off the end of the captured memory.
        assert_eq!(map.read_u64(0x100c), None);
        assert_eq!(map.read_pointer(0x1008, 8), Some(0x0f0e0d0c0b0a0908));
    }

    #[test]
    fn test_read_across_adjacent_regions() {
        let mut map = MemoryMap::new();
        map.insert(0x1000, (0u8..8).collect());
        map.insert(0x1008, (8u8..16).collect());
        map.insert(0x1020, vec![0xff; 8]);
        assert_eq!(map.read_u64(0x1004), Some(0x0b0a090807060504));
        let mut buf = [0u8; 16];
        map.read_memory(0x1000, &mut buf).unwrap();
        assert_eq!(buf.to_vec(), (0u8..16).collect::<Vec<_>>());
        // A hole between regions still fails the read.
        assert_eq!(map.read_u64(0x101c), None);
        assert!(matches!(
            map.read_memory(0x100c, &mut [0u8; 8]),
            Err(MemoryReadError::NotMapped {
                address: 0x100c,
                len: 8
            })
        ));
    }

    #[test]
    fn test_big_endian_reads() {
        let mut map = MemoryMap::with_endian(Endian::Big);
        map.insert(0x2000, vec![0, 0, 0, 0, 0x40, 0x10, 0x20, 0x30]);
        assert_eq!(map.endian(), Endian::Big);
        assert_eq!(map.read_u32(0x2004), Some(0x40102030));
        assert_eq!(map.read_u64(0x2000), Some(0x40102030));
        assert_eq!(map.read_pointer(0x2004, 4), Some(0x40102030));
        assert_eq!(MemoryMap::new().endian(), Endian::Little);
    }
}
