use crate::address_space::{AccessSize, Device, Rmw};
use crate::error::FatalError;
use std::cell::Cell;
use std::rc::Rc;

/// Base address of the test finisher MMIO region.
pub const FINISHER_BASE: u64 = 0x0010_0000;
pub const FINISHER_SIZE: u64 = 0x1000;

const FINISHER_FAIL: u64 = 0x3333;
const FINISHER_PASS: u64 = 0x5555;

/// Stop request written by the guest.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishStatus {
    Pass,
    Fail(u16),
}

impl FinishStatus {
    pub fn exit_code(self) -> i32 {
        match self {
            FinishStatus::Pass => 0,
            FinishStatus::Fail(0) => 1,
            FinishStatus::Fail(code) => code as i32,
        }
    }
}

/// Guest-requested stop. Reads return zero; a write of `0x5555` requests
/// a passing stop and `(code << 16) | 0x3333` a failing one. The run loop
/// checks `status()` after every step.
#[derive(Clone, Default)]
pub struct TestFinisher {
    status: Rc<Cell<Option<FinishStatus>>>,
}

impl TestFinisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> Option<FinishStatus> {
        self.status.get()
    }
}

impl Device for TestFinisher {
    fn read(&mut self, _addr: u64, _size: AccessSize, _rmw: Rmw) -> Result<u64, FatalError> {
        Ok(0)
    }

    fn write(
        &mut self,
        addr: u64,
        _size: AccessSize,
        data: u64,
        _rmw: Rmw,
    ) -> Result<u64, FatalError> {
        let status = match data & 0xFFFF {
            FINISHER_PASS => FinishStatus::Pass,
            FINISHER_FAIL => FinishStatus::Fail((data >> 16) as u16),
            other => {
                log::warn!("finisher: ignoring command {:#x} at offset {:#x}", other, addr);
                return Ok(0);
            }
        };
        log::info!("finisher: guest requested stop ({:?})", status);
        self.status.set(Some(status));
        Ok(0)
    }
}
