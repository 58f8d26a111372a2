use crate::csr::Mode;
use crate::error::FatalError;
use crate::regfile::RegisterFile;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;
use std::io;
use thiserror::Error;

/// Version identifier for snapshot compatibility checks.
pub const SNAPSHOT_VERSION: &str = "1.0";

#[derive(Debug, Error)]
pub enum SnapshotError {
    #[error("snapshot version mismatch: expected {expected}, found {found}")]
    Version { expected: String, found: String },

    #[error("snapshot has no memory region")]
    MissingRegion,

    #[error("snapshot RAM base mismatch: machine={machine:#x}, snapshot={snapshot:#x}")]
    Base { machine: u64, snapshot: u64 },

    #[error("snapshot RAM size mismatch: machine={machine} bytes, snapshot={snapshot} bytes")]
    Size { machine: u64, snapshot: u64 },

    #[error("snapshot RAM digest mismatch for base {0:#x}")]
    Digest(u64),

    #[error("snapshot encoding: {0}")]
    Encoding(#[from] bincode::Error),

    #[error(transparent)]
    Io(#[from] io::Error),

    #[error(transparent)]
    Fatal(#[from] FatalError),
}

/// Full machine snapshot: hart, interrupt-related device state and RAM.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Snapshot {
    pub version: String,
    pub cpu: CpuSnapshot,
    pub devices: DeviceSnapshot,
    pub memory: Vec<MemRegionSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CpuSnapshot {
    pub pc: u64,
    pub mode: Mode,
    pub regs: RegisterFile,
    /// Non-zero CSRs only.
    pub csrs: HashMap<u16, u64>,
    pub retired: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub timer: TimerSnapshot,
    pub plic: PlicSnapshot,
    pub uart: UartSnapshot,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TimerSnapshot {
    pub hz: u64,
    pub mtime: u64,
    pub mtimecmp: u64,
    pub msip: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlicSnapshot {
    pub priority: Vec<u32>,
    pub pending: u32,
    pub enable: Vec<u32>,
    pub threshold: Vec<u32>,
    pub active: Vec<u32>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct UartSnapshot {
    pub rx_fifo: Vec<u8>,
    pub tx_fifo: Vec<u8>,
    pub ier: u8,
    pub fcr: u8,
    pub lcr: u8,
    pub mcr: u8,
    pub lsr: u8,
    pub msr: u8,
    pub scr: u8,
    pub dll: u8,
    pub dlm: u8,
    pub thre_ip: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemRegionSnapshot {
    pub base: u64,
    pub size: u64,
    /// Hex SHA-256 of `data`.
    pub hash: String,
    pub data: Vec<u8>,
}

/// Hex SHA-256 digest.
pub fn digest(data: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data);
    hex::encode(hasher.finalize())
}

impl MemRegionSnapshot {
    pub fn capture(base: u64, data: Vec<u8>) -> Self {
        Self {
            base,
            size: data.len() as u64,
            hash: digest(&data),
            data,
        }
    }

    /// Check the region against the machine's RAM layout and its own digest.
    pub fn verify(&self, base: u64, size: u64) -> Result<(), SnapshotError> {
        if self.base != base {
            return Err(SnapshotError::Base {
                machine: base,
                snapshot: self.base,
            });
        }
        if self.size != size || self.data.len() as u64 != size {
            return Err(SnapshotError::Size {
                machine: size,
                snapshot: self.data.len() as u64,
            });
        }
        if digest(&self.data) != self.hash {
            return Err(SnapshotError::Digest(self.base));
        }
        Ok(())
    }
}

impl Snapshot {
    pub fn check_version(&self) -> Result<(), SnapshotError> {
        if self.version != SNAPSHOT_VERSION {
            return Err(SnapshotError::Version {
                expected: SNAPSHOT_VERSION.to_string(),
                found: self.version.clone(),
            });
        }
        Ok(())
    }

    pub fn encode(&self) -> Result<Vec<u8>, SnapshotError> {
        Ok(bincode::serialize(self)?)
    }

    pub fn decode(bytes: &[u8]) -> Result<Self, SnapshotError> {
        Ok(bincode::deserialize(bytes)?)
    }

    pub fn save(&self, path: &std::path::Path) -> Result<(), SnapshotError> {
        std::fs::write(path, self.encode()?)?;
        log::info!("snapshot: saved to {}", path.display());
        Ok(())
    }

    pub fn load(path: &std::path::Path) -> Result<Self, SnapshotError> {
        let snapshot = Self::decode(&std::fs::read(path)?)?;
        snapshot.check_version()?;
        Ok(snapshot)
    }
}
