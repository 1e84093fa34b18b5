//! Endpoint memory: the region remote peers write into and local requests
//! read from. Every access is bounds-checked.

use std::sync::Mutex;

use crate::error::XferError;

pub struct SharedRegion {
    bytes: Mutex<Vec<u8>>,
    size: usize,
}

impl SharedRegion {
    /// A zeroed region of `size` bytes.
    pub fn new(size: usize) -> Self {
        SharedRegion {
            bytes: Mutex::new(vec![0u8; size]),
            size,
        }
    }

    pub fn len(&self) -> usize {
        self.size
    }

    pub fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Validate `offset..offset + len` against the region.
    pub fn check(&self, offset: u64, len: u64) -> Result<(), XferError> {
        check_range(offset, len, self.size as u64)
    }

    pub fn read(&self, offset: usize, len: usize) -> Result<Vec<u8>, XferError> {
        self.check(offset as u64, len as u64)?;
        let bytes = self.bytes.lock().unwrap_or_else(|e| e.into_inner());
        Ok(bytes[offset..offset + len].to_vec())
    }

    pub fn write(&self, offset: usize, data: &[u8]) -> Result<(), XferError> {
        self.check(offset as u64, data.len() as u64)?;
        let mut bytes = self.bytes.lock().unwrap_or_else(|e| e.into_inner());
        bytes[offset..offset + data.len()].copy_from_slice(data);
        Ok(())
    }

    pub fn read_u32(&self, offset: usize) -> Result<u32, XferError> {
        self.check(offset as u64, 4)?;
        let bytes = self.bytes.lock().unwrap_or_else(|e| e.into_inner());
        let mut word = [0u8; 4];
        word.copy_from_slice(&bytes[offset..offset + 4]);
        Ok(u32::from_le_bytes(word))
    }

    pub fn write_u32(&self, offset: usize, value: u32) -> Result<(), XferError> {
        self.write(offset, &value.to_le_bytes())
    }

    /// Copy of the whole region.
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

/// Bounds check shared by local and remote ranges.
pub(crate) fn check_range(offset: u64, len: u64, size: u64) -> Result<(), XferError> {
    match offset.checked_add(len) {
        Some(end) if end <= size => Ok(()),
        _ => Err(XferError::OutOfBounds { offset, len, size }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn read_write_roundtrip() {
        let mem = SharedRegion::new(64);
        mem.write(8, b"payload").unwrap();
        assert_eq!(mem.read(8, 7).unwrap(), b"payload");
        mem.write_u32(60, 0xABCD_1234).unwrap();
        assert_eq!(mem.read_u32(60).unwrap(), 0xABCD_1234);
        assert_eq!(mem.snapshot().len(), 64);
    }

    #[test]
    fn out_of_bounds_rejected() {
        let mem = SharedRegion::new(16);
        assert!(matches!(
            mem.write(10, &[0u8; 8]),
            Err(XferError::OutOfBounds { offset: 10, len: 8, size: 16 })
        ));
        assert!(mem.read_u32(13).is_err());
        assert!(mem.read(0, 16).is_ok());
        assert!(check_range(u64::MAX, 2, 16).is_err());
    }
}
