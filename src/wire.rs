//! Unaligned little-endian wire integers and a typed view over raw buffers.
//!
//! Both FPGAs lay out their memory structures packed and little-endian
//! regardless of the host, so the field types here fix the endianness and
//! drop the alignment requirement; `WireRead` then lets a download buffer be
//! viewed as a slice of wire structs without copying.

use zerocopy::{FromBytes, LayoutVerified, Unaligned};

/// An unaligned little-endian `u16`.
#[derive(FromBytes, Unaligned, Debug, Default, Copy, Clone, PartialEq, Eq)]
#[repr(transparent)]
pub struct U16Le([u8; 2]);

impl U16Le {
    pub fn new(value: u16) -> Self {
        U16Le(value.to_le_bytes())
    }

    pub fn get(&self) -> u16 {
        u16::from_le_bytes(self.0)
    }
}

/// An unaligned little-endian `u32`.
#[derive(FromBytes, Unaligned, Debug, Default, Copy, Clone, PartialEq, Eq)]
#[repr(transparent)]
pub struct U32Le([u8; 4]);

impl U32Le {
    pub fn new(value: u32) -> Self {
        U32Le(value.to_le_bytes())
    }

    pub fn get(&self) -> u32 {
        u32::from_le_bytes(self.0)
    }
}

/// Typed reads out of a raw byte buffer.
pub trait WireRead {
    fn read_at<T: FromBytes>(&self, offset: usize) -> Option<&T>;
    fn read_slice_at<T: FromBytes>(&self, offset: usize, len: usize) -> Option<&[T]>;
}

impl WireRead for [u8] {
    fn read_at<T: FromBytes>(&self, offset: usize) -> Option<&T> {
        let end = offset.checked_add(core::mem::size_of::<T>())?;
        let lv = LayoutVerified::<&[u8], T>::new(self.get(offset..end)?)?;
        Some(lv.into_ref())
    }

    fn read_slice_at<T: FromBytes>(&self, offset: usize, len: usize) -> Option<&[T]> {
        let end = offset.checked_add(core::mem::size_of::<T>().checked_mul(len)?)?;
        let lv = LayoutVerified::<&[u8], [T]>::new_slice(self.get(offset..end)?)?;
        Some(lv.into_slice())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(FromBytes, Unaligned, Debug, PartialEq, Eq)]
    #[repr(C)]
    struct Pair {
        a: U16Le,
        b: U32Le,
    }

    #[test]
    fn unaligned_le_roundtrip() {
        assert_eq!(U16Le::new(0xbeef).get(), 0xbeef);
        assert_eq!(U32Le::new(0xdead_beef).get(), 0xdead_beef);
    }

    #[test]
    fn read_at_any_offset() {
        let buf = [0xffu8, 0x34, 0x12, 0x78, 0x56, 0x00, 0x00];
        let pair = buf.read_at::<Pair>(1).unwrap();
        assert_eq!(pair.a.get(), 0x1234);
        assert_eq!(pair.b.get(), 0x5678);
        assert!(buf.read_at::<Pair>(2).is_none());
    }

    #[test]
    fn read_slice_counts_elements() {
        let buf = [0x01u8, 0x00, 0x02, 0x00, 0x03, 0x00];
        let words = buf.read_slice_at::<U16Le>(0, 3).unwrap();
        assert_eq!(words[2].get(), 3);
        assert!(buf.read_slice_at::<U16Le>(0, 4).is_none());
    }
}
