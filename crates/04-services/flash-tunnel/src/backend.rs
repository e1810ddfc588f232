use parking_lot::Mutex;

use crate::error::{FlashError, FlashResult};

/// The flash controller the device side drives.
pub trait FlashBackend: Send + Sync {
    fn capacity(&self) -> u32;
    fn erase(&self, addr: u32, size: u32) -> FlashResult<()>;
    fn read(&self, addr: u32, out: &mut [u8]) -> FlashResult<()>;
    fn write(&self, addr: u32, data: &[u8]) -> FlashResult<()>;
}

/// Flash image kept in memory. Erased bytes read back as `0xFF`.
#[derive(Debug)]
pub struct MemFlash {
    bytes: Mutex<Vec<u8>>,
}

impl MemFlash {
    pub fn new(capacity: u32) -> Self {
        Self {
            bytes: Mutex::new(vec![0xFF; capacity as usize]),
        }
    }

    /// Copy of the whole image.
    pub fn snapshot(&self) -> Vec<u8> {
        self.bytes.lock().clone()
    }

    fn range(&self, addr: u32, len: usize) -> FlashResult<std::ops::Range<usize>> {
        let capacity = self.capacity();
        let start = addr as usize;
        match start.checked_add(len) {
            Some(end) if end <= capacity as usize => Ok(start..end),
            _ => Err(FlashError::OutOfRange {
                addr,
                len: len as u32,
                capacity,
            }),
        }
    }
}

impl FlashBackend for MemFlash {
    fn capacity(&self) -> u32 {
        self.bytes.lock().len() as u32
    }

    fn erase(&self, addr: u32, size: u32) -> FlashResult<()> {
        let range = self.range(addr, size as usize)?;
        self.bytes.lock()[range].fill(0xFF);
        Ok(())
    }

    fn read(&self, addr: u32, out: &mut [u8]) -> FlashResult<()> {
        let range = self.range(addr, out.len())?;
        out.copy_from_slice(&self.bytes.lock()[range]);
        Ok(())
    }

    fn write(&self, addr: u32, data: &[u8]) -> FlashResult<()> {
        let range = self.range(addr, data.len())?;
        self.bytes.lock()[range].copy_from_slice(data);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn erase_restores_ones() {
        let flash = MemFlash::new(64);
        flash.write(8, &[1, 2, 3, 4]).unwrap();
        flash.erase(8, 2).unwrap();
        let mut out = [0u8; 4];
        flash.read(8, &mut out).unwrap();
        assert_eq!(out, [0xFF, 0xFF, 3, 4]);
    }

    #[test]
    fn access_past_the_end_fails() {
        let flash = MemFlash::new(16);
        assert!(matches!(
            flash.write(14, &[0; 4]),
            Err(FlashError::OutOfRange { addr: 14, len: 4, capacity: 16 })
        ));
        assert!(flash.erase(u32::MAX, 2).is_err());
    }
}
