use serde::{Deserialize, Serialize};

pub const ABI_NAMES: [&str; 32] = [
    "zero", "ra", "sp", "gp", "tp", "t0", "t1", "t2", "s0", "s1", "a0", "a1", "a2", "a3", "a4",
    "a5", "a6", "a7", "s2", "s3", "s4", "s5", "s6", "s7", "s8", "s9", "s10", "s11", "t3", "t4",
    "t5", "t6",
];

/// ABI name of integer register `index` (e.g. `a0` for x10).
pub fn abi_name(index: u8) -> &'static str {
    ABI_NAMES[(index & 0x1F) as usize]
}

/// Upper half of a NaN-boxed single-precision value.
const NAN_BOX: u64 = 0xFFFF_FFFF_0000_0000;

/// Integer and floating-point registers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisterFile {
    x: [u64; 32],
    f: [u64; 32],
}

impl RegisterFile {
    pub fn new() -> Self {
        Self {
            x: [0; 32],
            f: [0; 32],
        }
    }

    pub fn read(&self, index: u8) -> u64 {
        self.x[(index & 0x1F) as usize]
    }

    /// Writes to x0 are dropped.
    pub fn write(&mut self, index: u8, value: u64) {
        let index = (index & 0x1F) as usize;
        if index != 0 {
            self.x[index] = value;
        }
    }

    pub fn read_f(&self, index: u8) -> u64 {
        self.f[(index & 0x1F) as usize]
    }

    pub fn write_f(&mut self, index: u8, value: u64) {
        self.f[(index & 0x1F) as usize] = value;
    }

    /// Store a 32-bit float pattern, NaN-boxed.
    pub fn write_f32(&mut self, index: u8, bits: u32) {
        self.write_f(index, NAN_BOX | bits as u64);
    }

    pub fn integer(&self) -> &[u64; 32] {
        &self.x
    }

    pub fn float(&self) -> &[u64; 32] {
        &self.f
    }
}

impl Default for RegisterFile {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_x0_is_hardwired() {
        let mut regs = RegisterFile::new();
        regs.write(0, 0xdead);
        regs.write(5, 0xbeef);
        assert_eq!(regs.read(0), 0);
        assert_eq!(regs.read(5), 0xbeef);
    }

    #[test]
    fn test_nan_boxing_and_names() {
        let mut regs = RegisterFile::new();
        regs.write_f32(3, 0x3F80_0000);
        assert_eq!(regs.read_f(3), 0xFFFF_FFFF_3F80_0000);
        assert_eq!(abi_name(0), "zero");
        assert_eq!(abi_name(2), "sp");
        assert_eq!(abi_name(10), "a0");
        assert_eq!(abi_name(31), "t6");
    }
}
