use crate::decoder::{DecodeError, Operation};
use crate::memory::MemoryError;
use thiserror::Error;

/// Conditions that indicate a bug in the emulator or its board wiring rather
/// than guest behaviour. None of these are recoverable.
#[derive(Debug, Error)]
pub enum FatalError {
    #[error("cannot decode {raw:#010x} at pc {pc:#x}: {reason}")]
    UnknownEncoding {
        pc: u64,
        raw: u32,
        reason: DecodeError,
    },

    #[error("bad access size {size} at {addr:#x}")]
    BadAccessSize { addr: u64, size: usize },

    #[error("no device maps {addr:#x} ({op} of {size} bytes)")]
    Unmapped {
        addr: u64,
        size: usize,
        op: &'static str,
    },

    #[error("CSR {0:#05x} is known but not implemented")]
    UnimplementedCsr(u16),

    #[error("trap exit through `{0}`")]
    BadTrapExit(Operation),

    #[error("write to read-only device `{device}` at offset {addr:#x}")]
    ReadOnly { device: &'static str, addr: u64 },

    #[error(transparent)]
    Memory(#[from] MemoryError),
}
