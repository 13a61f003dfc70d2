//! Bounds-checked little-endian reads over an in-memory image file.

use crate::platform::SymbolError;

#[derive(Clone, Copy)]
pub struct ByteReader<'a> {
    data: &'a [u8],
}

impl<'a> ByteReader<'a> {
    pub fn new(data: &'a [u8]) -> Self {
        Self { data }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    pub fn slice(&self, offset: usize, len: usize) -> Result<&'a [u8], SymbolError> {
        offset
            .checked_add(len)
            .and_then(|end| self.data.get(offset..end))
            .ok_or(SymbolError::OutOfBounds { offset, len })
    }

    /// A sub-reader over `[offset, offset + len)`. Offsets passed to the
    /// returned reader are relative to `offset`.
    pub fn sub(&self, offset: usize, len: usize) -> Result<ByteReader<'a>, SymbolError> {
        self.slice(offset, len).map(ByteReader::new)
    }

    fn array<const N: usize>(&self, offset: usize) -> Result<[u8; N], SymbolError> {
        let bytes = self.slice(offset, N)?;
        let mut out = [0u8; N];
        out.copy_from_slice(bytes);
        Ok(out)
    }

    pub fn u8_at(&self, offset: usize) -> Result<u8, SymbolError> {
        Ok(self.array::<1>(offset)?[0])
    }

    pub fn u16_at(&self, offset: usize) -> Result<u16, SymbolError> {
        self.array(offset).map(u16::from_le_bytes)
    }

    pub fn u32_at(&self, offset: usize) -> Result<u32, SymbolError> {
        self.array(offset).map(u32::from_le_bytes)
    }

    pub fn u64_at(&self, offset: usize) -> Result<u64, SymbolError> {
        self.array(offset).map(u64::from_le_bytes)
    }

    /// The NUL-terminated byte string starting at `offset` (terminator excluded).
    pub fn cstr_at(&self, offset: usize) -> Result<&'a [u8], SymbolError> {
        let tail = self
            .data
            .get(offset..)
            .ok_or(SymbolError::OutOfBounds { offset, len: 1 })?;
        let end = tail
            .iter()
            .position(|&b| b == 0)
            .ok_or(SymbolError::OutOfBounds {
                offset,
                len: tail.len() + 1,
            })?;
        Ok(&tail[..end])
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_little_endian() {
        let data = [0x01, 0x02, 0x03, 0x04, 0x05, 0x06, 0x07, 0x08];
        let r = ByteReader::new(&data);
        assert_eq!(r.u8_at(0).unwrap(), 0x01);
        assert_eq!(r.u16_at(0).unwrap(), 0x0201);
        assert_eq!(r.u32_at(4).unwrap(), 0x0807_0605);
        assert_eq!(r.u64_at(0).unwrap(), 0x0807_0605_0403_0201);
    }

    #[test]
    fn out_of_bounds_is_an_error() {
        let data = [0u8; 4];
        let r = ByteReader::new(&data);
        assert!(matches!(
            r.u64_at(0),
            Err(SymbolError::OutOfBounds { offset: 0, len: 8 })
        ));
        assert!(r.u32_at(1).is_err());
        assert!(r.slice(usize::MAX, 2).is_err());
    }

    #[test]
    fn sub_reader_is_relative() {
        let data = [0, 0, 0xaa, 0xbb, 0, 0];
        let r = ByteReader::new(&data).sub(2, 2).unwrap();
        assert_eq!(r.len(), 2);
        assert_eq!(r.u16_at(0).unwrap(), 0xbbaa);
        assert!(r.u8_at(2).is_err());
    }

    #[test]
    fn cstr_requires_terminator() {
        let data = b"main\0foo";
        let r = ByteReader::new(data);
        assert_eq!(r.cstr_at(0).unwrap(), b"main");
        assert_eq!(r.cstr_at(4).unwrap(), b"");
        assert!(r.cstr_at(5).is_err());
        assert!(r.cstr_at(100).is_err());
    }
}
