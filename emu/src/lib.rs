pub mod address_space;
pub mod console;
pub mod cpu;
pub mod csr;
pub mod decoder;
pub mod error;
pub mod execute;
pub mod finisher;
pub mod interrupt;
pub mod loader;
pub mod machine;
pub mod memory;
pub mod mmu;
pub mod regfile;
pub mod snapshot;
pub mod timer;
pub mod trace;
pub mod trap;
pub mod uart;

use crate::error::FatalError;
use crate::trap::Exception;

/// Outcome of a failed step of emulation.
///
/// `Exception` is guest-visible and is always routed through trap entry.
/// `Fatal` means the emulator itself is in an undefined state and must stop.
#[derive(Debug)]
pub enum Trap {
    Exception(Exception),
    Fatal(FatalError),
}

impl From<Exception> for Trap {
    fn from(e: Exception) -> Self {
        Trap::Exception(e)
    }
}

impl From<FatalError> for Trap {
    fn from(e: FatalError) -> Self {
        Trap::Fatal(e)
    }
}

impl std::fmt::Display for Trap {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Trap::Exception(e) => write!(f, "{:?}", e),
            Trap::Fatal(e) => write!(f, "{}", e),
        }
    }
}

impl std::error::Error for Trap {}
