//! The growable output buffer every stream is serialized into.
//!
//! Offsets inside a minidump are 32-bit RVAs, so the buffer refuses to grow
//! past 4 GiB. Space is reserved zeroed first and filled in afterwards,
//! which lets headers and directories be patched once their contents are
//! known.

use minidump_common::format::{MINIDUMP_LOCATION_DESCRIPTOR, RVA};
use scroll::ctx::{SizeWith, TryIntoCtx};
use scroll::{Endian, Pwrite};

#[derive(Debug, Default)]
pub struct DumpBuf {
    buf: Vec<u8>,
}

fn rva_overflow(offset: usize) -> scroll::Error {
    scroll::Error::Custom(format!("offset {offset:#x} does not fit in a 32-bit RVA"))
}

impl DumpBuf {
    pub fn with_capacity(capacity: usize) -> DumpBuf {
        DumpBuf {
            buf: Vec::with_capacity(capacity),
        }
    }

    /// The offset the next write lands at.
    pub fn position(&self) -> usize {
        self.buf.len()
    }

    fn location(&self, start: usize) -> Result<MINIDUMP_LOCATION_DESCRIPTOR, scroll::Error> {
        let rva = RVA::try_from(start).map_err(|_| rva_overflow(start))?;
        let len = self.buf.len() - start;
        let data_size = u32::try_from(len).map_err(|_| rva_overflow(self.buf.len()))?;
        RVA::try_from(self.buf.len()).map_err(|_| rva_overflow(self.buf.len()))?;
        Ok(MINIDUMP_LOCATION_DESCRIPTOR { data_size, rva })
    }

    /// Reserve `len` zeroed bytes.
    pub fn reserve(&mut self, len: usize) -> Result<MINIDUMP_LOCATION_DESCRIPTOR, scroll::Error> {
        let start = self.buf.len();
        self.buf.resize(start + len, 0);
        self.location(start)
    }

    /// Append a format struct, little-endian.
    pub fn write<T>(&mut self, val: &T) -> Result<MINIDUMP_LOCATION_DESCRIPTOR, scroll::Error>
    where
        T: SizeWith<Endian>,
        for<'a> &'a T: TryIntoCtx<Endian, Error = scroll::Error>,
    {
        let location = self.reserve(T::size_with(&Endian::Little))?;
        self.buf
            .pwrite_with(val, location.rva as usize, Endian::Little)?;
        Ok(location)
    }

    /// Append a u32 count followed by `items`, the layout of every list stream.
    pub fn write_list<T>(&mut self, items: &[T]) -> Result<MINIDUMP_LOCATION_DESCRIPTOR, scroll::Error>
    where
        T: SizeWith<Endian>,
        for<'a> &'a T: TryIntoCtx<Endian, Error = scroll::Error>,
    {
        let start = self.buf.len();
        let count = u32::try_from(items.len()).map_err(|_| rva_overflow(items.len()))?;
        self.write::<u32>(&count)?;
        for item in items {
            self.write(item)?;
        }
        self.location(start)
    }

    /// Overwrite a struct previously reserved at `rva`.
    pub fn write_at<T>(&mut self, rva: RVA, val: &T) -> Result<(), scroll::Error>
    where
        for<'a> &'a T: TryIntoCtx<Endian, Error = scroll::Error>,
    {
        self.buf.pwrite_with(val, rva as usize, Endian::Little)?;
        Ok(())
    }

    pub fn write_all(&mut self, bytes: &[u8]) -> Result<MINIDUMP_LOCATION_DESCRIPTOR, scroll::Error> {
        let start = self.buf.len();
        self.buf.extend_from_slice(bytes);
        self.location(start)
    }

    /// Append a u32 byte length followed by the UTF-16LE encoding of `s`.
    ///
    /// A NUL terminator follows the string but is not counted in its length.
    pub fn write_string(&mut self, s: &str) -> Result<MINIDUMP_LOCATION_DESCRIPTOR, scroll::Error> {
        let units: Vec<u8> = s.encode_utf16().flat_map(u16::to_le_bytes).collect();
        let len = u32::try_from(units.len()).map_err(|_| rva_overflow(units.len()))?;
        let start = self.buf.len();
        self.write(&len)?;
        self.buf.extend_from_slice(&units);
        self.buf.extend_from_slice(&[0, 0]);
        self.location(start)
    }

    /// Pad with zeroes up to a multiple of `align`.
    pub fn align(&mut self, align: usize) {
        let len = self.buf.len().next_multiple_of(align);
        self.buf.resize(len, 0);
    }

    pub fn as_slice(&self) -> &[u8] {
        &self.buf
    }

    pub fn into_inner(self) -> Vec<u8> {
        self.buf
    }
}
