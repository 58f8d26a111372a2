use crate::address_space::{AccessSize, Device, Rmw};
use crate::error::FatalError;
use thiserror::Error;

/// Base physical address of RAM on the default board.
pub const RAM_BASE: u64 = 0x8000_0000;

/// Base physical address of the boot ROM.
pub const ROM_BASE: u64 = 0x0000_1000;

/// Backing-store errors.
#[derive(Debug, Error)]
pub enum MemoryError {
    #[error("out-of-bounds memory access at offset {offset:#x} ({len} bytes)")]
    OutOfBounds { offset: u64, len: usize },
}

fn check_bounds(data: &[u8], offset: u64, len: usize) -> Result<usize, MemoryError> {
    let off = usize::try_from(offset).map_err(|_| MemoryError::OutOfBounds { offset, len })?;
    let end = off
        .checked_add(len)
        .ok_or(MemoryError::OutOfBounds { offset, len })?;
    if end > data.len() {
        return Err(MemoryError::OutOfBounds { offset, len });
    }
    Ok(off)
}

fn load_le(data: &[u8], offset: u64, size: AccessSize) -> Result<u64, MemoryError> {
    let n = size.bytes();
    let off = check_bounds(data, offset, n)?;
    let mut bytes = [0u8; 8];
    bytes[..n].copy_from_slice(&data[off..off + n]);
    Ok(u64::from_le_bytes(bytes))
}

/// Flat, zero-initialised RAM.
///
/// Any alignment is accepted; an access only has to fit inside the buffer.
pub struct Ram {
    data: Vec<u8>,
}

impl Ram {
    pub fn new(size: usize) -> Self {
        Self {
            data: vec![0; size],
        }
    }

    pub fn len(&self) -> usize {
        self.data.len()
    }

    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

impl Device for Ram {
    fn read(&mut self, addr: u64, size: AccessSize, _rmw: Rmw) -> Result<u64, FatalError> {
        Ok(load_le(&self.data, addr, size)?)
    }

    fn write(
        &mut self,
        addr: u64,
        size: AccessSize,
        data: u64,
        rmw: Rmw,
    ) -> Result<u64, FatalError> {
        let old = load_le(&self.data, addr, size)?;
        let new = rmw.apply(old, data, size);
        let n = size.bytes();
        let off = addr as usize;
        self.data[off..off + n].copy_from_slice(&new.to_le_bytes()[..n]);
        Ok(old)
    }
}

/// Read-only boot image. Reads past the image return zero up to `size`.
pub struct Rom {
    image: Vec<u8>,
    size: usize,
}

impl Rom {
    pub fn new(image: Vec<u8>, size: usize) -> Self {
        Self {
            size: size.max(image.len()),
            image,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }
}

impl Device for Rom {
    fn read(&mut self, addr: u64, size: AccessSize, _rmw: Rmw) -> Result<u64, FatalError> {
        let n = size.bytes();
        let end = addr
            .checked_add(n as u64)
            .ok_or(MemoryError::OutOfBounds { offset: addr, len: n })?;
        if end > self.size as u64 {
            return Err(MemoryError::OutOfBounds { offset: addr, len: n }.into());
        }
        let mut bytes = [0u8; 8];
        for (i, b) in bytes.iter_mut().take(n).enumerate() {
            *b = self.image.get(addr as usize + i).copied().unwrap_or(0);
        }
        Ok(u64::from_le_bytes(bytes))
    }

    fn write(
        &mut self,
        addr: u64,
        _size: AccessSize,
        _data: u64,
        _rmw: Rmw,
    ) -> Result<u64, FatalError> {
        Err(FatalError::ReadOnly { device: "rom", addr })
    }
}
