use crate::error::FatalError;
use crate::timer::Timebase;
use crate::trap::Exception;
use crate::Trap;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Mode {
    User,
    Supervisor,
    Machine,
}

impl Mode {
    /// Encode privilege mode into the MPP/SPP field encoding.
    pub fn to_mpp(self) -> u64 {
        match self {
            Mode::User => 0b00,
            Mode::Supervisor => 0b01,
            Mode::Machine => 0b11,
        }
    }

    /// Decode MPP/SPP field into a privilege mode.
    pub fn from_mpp(bits: u64) -> Mode {
        match bits & 0b11 {
            0b00 => Mode::User,
            0b01 => Mode::Supervisor,
            // 0b10 is reserved; treat as Machine for WARL coercion.
            _ => Mode::Machine,
        }
    }

    /// Numeric privilege level as used in CSR address bits [9:8].
    pub fn level(self) -> u16 {
        self.to_mpp() as u16
    }
}

/// Read-modify-write flavour of a CSR instruction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CsrOp {
    Write,
    Set,
    Clear,
}

// Unprivileged floating-point and counter CSRs
pub const CSR_FFLAGS: u16 = 0x001;
pub const CSR_FRM: u16 = 0x002;
pub const CSR_FCSR: u16 = 0x003;
pub const CSR_CYCLE: u16 = 0xC00;
pub const CSR_TIME: u16 = 0xC01;
pub const CSR_INSTRET: u16 = 0xC02;
pub const CSR_HPMCOUNTER3: u16 = 0xC03;
pub const CSR_HPMCOUNTER31: u16 = 0xC1F;

// Supervisor CSRs
pub const CSR_SSTATUS: u16 = 0x100;
pub const CSR_SIE: u16 = 0x104;
pub const CSR_STVEC: u16 = 0x105;
pub const CSR_SCOUNTEREN: u16 = 0x106;
pub const CSR_SENVCFG: u16 = 0x10A;
pub const CSR_SSCRATCH: u16 = 0x140;
pub const CSR_SEPC: u16 = 0x141;
pub const CSR_SCAUSE: u16 = 0x142;
pub const CSR_STVAL: u16 = 0x143;
pub const CSR_SIP: u16 = 0x144;
pub const CSR_STIMECMP: u16 = 0x14D;
pub const CSR_SATP: u16 = 0x180;

// Machine CSRs
pub const CSR_MSTATUS: u16 = 0x300;
pub const CSR_MISA: u16 = 0x301;
pub const CSR_MEDELEG: u16 = 0x302;
pub const CSR_MIDELEG: u16 = 0x303;
pub const CSR_MIE: u16 = 0x304;
pub const CSR_MTVEC: u16 = 0x305;
pub const CSR_MCOUNTEREN: u16 = 0x306;
pub const CSR_MENVCFG: u16 = 0x30A;
pub const CSR_MCOUNTINHIBIT: u16 = 0x320;
pub const CSR_MHPMEVENT3: u16 = 0x323;
pub const CSR_MHPMEVENT31: u16 = 0x33F;
pub const CSR_MSCRATCH: u16 = 0x340;
pub const CSR_MEPC: u16 = 0x341;
pub const CSR_MCAUSE: u16 = 0x342;
pub const CSR_MTVAL: u16 = 0x343;
pub const CSR_MIP: u16 = 0x344;
pub const CSR_PMPCFG0: u16 = 0x3A0;
pub const CSR_PMPCFG15: u16 = 0x3AF;
pub const CSR_PMPADDR0: u16 = 0x3B0;
pub const CSR_PMPADDR15: u16 = 0x3BF;
pub const CSR_PMPADDR16: u16 = 0x3C0;
pub const CSR_PMPADDR63: u16 = 0x3EF;
pub const CSR_MCYCLE: u16 = 0xB00;
pub const CSR_MINSTRET: u16 = 0xB02;
pub const CSR_MHPMCOUNTER3: u16 = 0xB03;
pub const CSR_MHPMCOUNTER31: u16 = 0xB1F;

// Debug/trace trigger CSRs (recognised, not modelled)
pub const CSR_TSELECT: u16 = 0x7A0;
pub const CSR_DSCRATCH0: u16 = 0x7B2;

// Machine Information Registers (read-only)
pub const CSR_MVENDORID: u16 = 0xF11;
pub const CSR_MARCHID: u16 = 0xF12;
pub const CSR_MIMPID: u16 = 0xF13;
pub const CSR_MHARTID: u16 = 0xF14;
pub const CSR_MCONFIGPTR: u16 = 0xF15;

// mstatus fields
pub const MSTATUS_SIE: u64 = 1 << 1;
pub const MSTATUS_MIE: u64 = 1 << 3;
pub const MSTATUS_SPIE: u64 = 1 << 5;
pub const MSTATUS_MPIE: u64 = 1 << 7;
pub const MSTATUS_SPP: u64 = 1 << 8;
pub const MSTATUS_MPP_SHIFT: u64 = 11;
pub const MSTATUS_MPP: u64 = 0b11 << MSTATUS_MPP_SHIFT;
pub const MSTATUS_FS: u64 = 0b11 << 13;
pub const MSTATUS_MPRV: u64 = 1 << 17;
pub const MSTATUS_SUM: u64 = 1 << 18;
pub const MSTATUS_MXR: u64 = 1 << 19;
pub const MSTATUS_TVM: u64 = 1 << 20;
pub const MSTATUS_TW: u64 = 1 << 21;
pub const MSTATUS_TSR: u64 = 1 << 22;
/// UXL = SXL = 2 (64-bit); read-only here.
const MSTATUS_XLEN64: u64 = (2 << 32) | (2 << 34);

const MSTATUS_WRITABLE: u64 = MSTATUS_SIE
    | MSTATUS_MIE
    | MSTATUS_SPIE
    | MSTATUS_MPIE
    | MSTATUS_SPP
    | MSTATUS_MPP
    | MSTATUS_FS
    | MSTATUS_MPRV
    | MSTATUS_SUM
    | MSTATUS_MXR
    | MSTATUS_TVM
    | MSTATUS_TW
    | MSTATUS_TSR;

const SSTATUS_MASK: u64 =
    MSTATUS_SIE | MSTATUS_SPIE | MSTATUS_SPP | MSTATUS_FS | MSTATUS_SUM | MSTATUS_MXR;
/// sstatus additionally shows UXL.
const SSTATUS_READ_MASK: u64 = SSTATUS_MASK | (3 << 32);

// mip/mie bits
pub const MIP_SSIP: u64 = 1 << 1;
pub const MIP_MSIP: u64 = 1 << 3;
pub const MIP_STIP: u64 = 1 << 5;
pub const MIP_MTIP: u64 = 1 << 7;
pub const MIP_SEIP: u64 = 1 << 9;
pub const MIP_MEIP: u64 = 1 << 11;

const S_INTERRUPTS: u64 = MIP_SSIP | MIP_STIP | MIP_SEIP;
/// mip bits that machine-mode software may write directly.
const MIP_WRITABLE: u64 = MIP_SSIP | MIP_STIP;

/// menvcfg.STCE: enables the supervisor timer compare register.
pub const MENVCFG_STCE: u64 = 1 << 63;

/// RV64 with I, M, A, C, S and U.
const MISA_RV64IMACSU: u64 = (2 << 62)
    | (1 << (b'I' - b'A'))
    | (1 << (b'M' - b'A'))
    | (1 << (b'A' - b'A'))
    | (1 << (b'C' - b'A'))
    | (1 << (b'S' - b'A'))
    | (1 << (b'U' - b'A'));

/// The 4096-entry CSR bank plus the hart's current privilege level.
pub struct CsrFile {
    regs: Box<[u64; 4096]>,
    mode: Mode,
    retired: u64,
    timebase: Timebase,
}

impl CsrFile {
    pub fn new(timebase: Timebase) -> Self {
        let mut regs = Box::new([0u64; 4096]);
        regs[CSR_MISA as usize] = MISA_RV64IMACSU;
        regs[CSR_MSTATUS as usize] = MSTATUS_XLEN64;
        Self {
            regs,
            mode: Mode::Machine,
            retired: 0,
            timebase,
        }
    }

    pub fn mode(&self) -> Mode {
        self.mode
    }

    /// Only trap entry/exit (and snapshot restore) change privilege.
    pub(crate) fn set_mode(&mut self, mode: Mode) {
        self.mode = mode;
    }

    pub fn timebase(&self) -> &Timebase {
        &self.timebase
    }

    /// Count one retired instruction.
    pub fn retire(&mut self) {
        self.retired = self.retired.wrapping_add(1);
    }

    pub fn retired(&self) -> u64 {
        self.retired
    }

    /// Raw storage access for the trap controller and MMU. No privilege or
    /// validity checks, no computed views.
    pub fn get(&self, addr: u16) -> u64 {
        self.regs[(addr & 0xFFF) as usize]
    }

    pub fn set(&mut self, addr: u16, value: u64) {
        self.regs[(addr & 0xFFF) as usize] = value;
    }

    fn check_privilege(&self, addr: u16) -> Result<(), Trap> {
        // CSR address bits [9:8] encode the lowest privilege level that can access it.
        let required = (addr >> 8) & 0x3;
        if self.mode.level() < required {
            return Err(Exception::IllegalInstruction(0).into());
        }
        Ok(())
    }

    /// Architectural read of a CSR as seen by the current privilege level.
    pub fn read(&self, addr: u16) -> Result<u64, Trap> {
        self.check_privilege(addr)?;
        let value = match addr {
            CSR_SSTATUS => self.get(CSR_MSTATUS) & SSTATUS_READ_MASK,
            CSR_SIE => self.get(CSR_MIE) & S_INTERRUPTS,
            CSR_SIP => self.get(CSR_MIP) & S_INTERRUPTS,

            CSR_CYCLE | CSR_INSTRET | CSR_MCYCLE | CSR_MINSTRET => self.retired,
            CSR_TIME => self.timebase.now(),
            CSR_MCOUNTEREN | CSR_SCOUNTEREN => 0x7,

            CSR_FFLAGS => self.get(CSR_FCSR) & 0x1F,
            CSR_FRM => (self.get(CSR_FCSR) >> 5) & 0x7,
            CSR_FCSR => self.get(CSR_FCSR) & 0xFF,

            // RV64 only has the even-numbered pmpcfg registers.
            CSR_PMPCFG0..=CSR_PMPCFG15 if addr % 2 == 1 => {
                return Err(Exception::IllegalInstruction(0).into())
            }

            CSR_STVEC | CSR_SENVCFG | CSR_SSCRATCH | CSR_SEPC | CSR_SCAUSE | CSR_STVAL
            | CSR_STIMECMP | CSR_SATP | CSR_MSTATUS | CSR_MISA | CSR_MEDELEG | CSR_MIDELEG
            | CSR_MIE | CSR_MTVEC | CSR_MENVCFG | CSR_MCOUNTINHIBIT | CSR_MSCRATCH | CSR_MEPC
            | CSR_MCAUSE | CSR_MTVAL | CSR_MIP | CSR_PMPCFG0..=CSR_PMPCFG15
            | CSR_PMPADDR0..=CSR_PMPADDR15 | CSR_MVENDORID | CSR_MARCHID | CSR_MIMPID
            | CSR_MHARTID | CSR_MCONFIGPTR => self.get(addr),

            // Known but unsupported counters and PMP entries.
            CSR_PMPADDR16..=CSR_PMPADDR63
            | CSR_HPMCOUNTER3..=CSR_HPMCOUNTER31
            | CSR_MHPMCOUNTER3..=CSR_MHPMCOUNTER31
            | CSR_MHPMEVENT3..=CSR_MHPMEVENT31 => {
                return Err(Exception::IllegalInstruction(0).into())
            }

            CSR_TSELECT..=CSR_DSCRATCH0 => {
                return Err(FatalError::UnimplementedCsr(addr).into())
            }

            _ => return Err(Exception::IllegalInstruction(0).into()),
        };
        Ok(value)
    }

    /// CSR read-modify-write. The old value is read first (and any fault from
    /// that read wins), then the new value is computed and stored. Returns the
    /// old value.
    pub fn update(&mut self, addr: u16, data: u64, op: CsrOp) -> Result<u64, Trap> {
        let old = self.read(addr)?;
        // Read-only CSRs have bits [11:10] == 0b11
        if (addr >> 10) & 0x3 == 0x3 {
            return Err(Exception::IllegalInstruction(0).into());
        }
        let new = match op {
            CsrOp::Write => data,
            CsrOp::Set => old | data,
            CsrOp::Clear => old & !data,
        };
        self.store(addr, new);
        Ok(old)
    }

    fn store(&mut self, addr: u16, value: u64) {
        match addr {
            CSR_MSTATUS => {
                let mut v = value & MSTATUS_WRITABLE;
                // MPP=2 is reserved; coerce to U.
                if (v & MSTATUS_MPP) >> MSTATUS_MPP_SHIFT == 0b10 {
                    v &= !MSTATUS_MPP;
                }
                self.set(CSR_MSTATUS, v | MSTATUS_XLEN64);
            }
            CSR_SSTATUS => {
                let mstatus = self.get(CSR_MSTATUS);
                self.set(
                    CSR_MSTATUS,
                    (mstatus & !SSTATUS_MASK) | (value & SSTATUS_MASK),
                );
            }
            CSR_SIE => {
                let mie = self.get(CSR_MIE);
                self.set(CSR_MIE, (mie & !S_INTERRUPTS) | (value & S_INTERRUPTS));
            }
            CSR_SIP => {
                // Only SSIP is writable through sip.
                let mip = self.get(CSR_MIP);
                self.set(CSR_MIP, (mip & !MIP_SSIP) | (value & MIP_SSIP));
            }
            CSR_MIP => {
                let mip = self.get(CSR_MIP);
                self.set(CSR_MIP, (mip & !MIP_WRITABLE) | (value & MIP_WRITABLE));
            }
            CSR_MIDELEG => self.set(CSR_MIDELEG, value & S_INTERRUPTS),
            // ecall from M can never be delegated.
            CSR_MEDELEG => self.set(CSR_MEDELEG, value & !(1 << 11)),
            CSR_MISA => {}
            CSR_MEPC | CSR_SEPC => self.set(addr, value & !1),
            CSR_MTVEC | CSR_STVEC => {
                // Direct (0) and vectored (1) only.
                let mode = value & 0b11;
                let value = if mode > 1 { value & !0b11 } else { value };
                self.set(addr, value);
            }
            CSR_SATP => {
                // Bare or Sv39; anything else leaves satp unchanged.
                let satp_mode = value >> 60;
                if satp_mode == 0 || satp_mode == 8 {
                    self.set(CSR_SATP, value);
                }
            }
            CSR_CYCLE | CSR_INSTRET | CSR_MCYCLE | CSR_MINSTRET => self.retired = value,
            CSR_FFLAGS => {
                let fcsr = self.get(CSR_FCSR);
                self.set(CSR_FCSR, (fcsr & !0x1F) | (value & 0x1F));
            }
            CSR_FRM => {
                let fcsr = self.get(CSR_FCSR);
                self.set(CSR_FCSR, (fcsr & !0xE0) | ((value & 0x7) << 5));
            }
            CSR_FCSR => self.set(CSR_FCSR, value & 0xFF),
            _ => self.set(addr, value),
        }
    }

    /// Export the non-zero part of the CSR image for snapshots.
    pub fn export(&self) -> HashMap<u16, u64> {
        let mut map = HashMap::new();
        for (idx, &val) in self.regs.iter().enumerate() {
            if val != 0 {
                map.insert(idx as u16, val);
            }
        }
        map
    }

    /// Restore from an exported image. CSRs missing from the map become 0.
    pub fn import(&mut self, map: &HashMap<u16, u64>, mode: Mode, retired: u64) {
        self.regs.fill(0);
        for (&addr, &val) in map.iter() {
            if (addr as usize) < self.regs.len() {
                self.regs[addr as usize] = val;
            }
        }
        self.mode = mode;
        self.retired = retired;
    }
}

impl Default for CsrFile {
    fn default() -> Self {
        Self::new(Timebase::default())
    }
}

/// Name of a CSR for trace output.
pub fn csr_name(addr: u16) -> &'static str {
    match addr {
        CSR_FFLAGS => "fflags",
        CSR_FRM => "frm",
        CSR_FCSR => "fcsr",
        CSR_CYCLE => "cycle",
        CSR_TIME => "time",
        CSR_INSTRET => "instret",
        CSR_SSTATUS => "sstatus",
        CSR_SIE => "sie",
        CSR_STVEC => "stvec",
        CSR_SCOUNTEREN => "scounteren",
        CSR_SENVCFG => "senvcfg",
        CSR_SSCRATCH => "sscratch",
        CSR_SEPC => "sepc",
        CSR_SCAUSE => "scause",
        CSR_STVAL => "stval",
        CSR_SIP => "sip",
        CSR_STIMECMP => "stimecmp",
        CSR_SATP => "satp",
        CSR_MSTATUS => "mstatus",
        CSR_MISA => "misa",
        CSR_MEDELEG => "medeleg",
        CSR_MIDELEG => "mideleg",
        CSR_MIE => "mie",
        CSR_MTVEC => "mtvec",
        CSR_MCOUNTEREN => "mcounteren",
        CSR_MENVCFG => "menvcfg",
        CSR_MCOUNTINHIBIT => "mcountinhibit",
        CSR_MSCRATCH => "mscratch",
        CSR_MEPC => "mepc",
        CSR_MCAUSE => "mcause",
        CSR_MTVAL => "mtval",
        CSR_MIP => "mip",
        CSR_PMPCFG0..=CSR_PMPCFG15 => "pmpcfg",
        CSR_PMPADDR0..=CSR_PMPADDR63 => "pmpaddr",
        CSR_MCYCLE => "mcycle",
        CSR_MINSTRET => "minstret",
        CSR_MHPMCOUNTER3..=CSR_MHPMCOUNTER31 => "mhpmcounter",
        CSR_HPMCOUNTER3..=CSR_HPMCOUNTER31 => "hpmcounter",
        CSR_MHPMEVENT3..=CSR_MHPMEVENT31 => "mhpmevent",
        CSR_TSELECT..=CSR_DSCRATCH0 => "debug",
        CSR_MVENDORID => "mvendorid",
        CSR_MARCHID => "marchid",
        CSR_MIMPID => "mimpid",
        CSR_MHARTID => "mhartid",
        CSR_MCONFIGPTR => "mconfigptr",
        _ => "unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn is_illegal(r: Result<u64, Trap>) -> bool {
        matches!(r, Err(Trap::Exception(Exception::IllegalInstruction(_))))
    }

    #[test]
    fn test_csrrs_returns_old_value() {
        let mut csr = CsrFile::default();
        csr.update(CSR_MSCRATCH, 0x5, CsrOp::Write).unwrap();
        let old = csr.update(CSR_MSCRATCH, 0x2, CsrOp::Set).unwrap();
        assert_eq!(old, 0x5);
        assert_eq!(csr.read(CSR_MSCRATCH).unwrap(), 0x7);

        let old = csr.update(CSR_MSCRATCH, 0x1, CsrOp::Clear).unwrap();
        assert_eq!(old, 0x7);
        assert_eq!(csr.read(CSR_MSCRATCH).unwrap(), 0x6);
    }

    #[test]
    fn test_sstatus_is_view_of_mstatus() {
        let mut csr = CsrFile::default();
        csr.update(CSR_MSTATUS, MSTATUS_MIE | MSTATUS_SIE, CsrOp::Write)
            .unwrap();
        let sstatus = csr.read(CSR_SSTATUS).unwrap();
        assert_eq!(sstatus & MSTATUS_SIE, MSTATUS_SIE);
        assert_eq!(sstatus & MSTATUS_MIE, 0);

        csr.update(CSR_SSTATUS, MSTATUS_SUM, CsrOp::Set).unwrap();
        let mstatus = csr.read(CSR_MSTATUS).unwrap();
        assert_eq!(mstatus & (MSTATUS_SUM | MSTATUS_MIE), MSTATUS_SUM | MSTATUS_MIE);
    }

    #[test]
    fn test_sie_sip_masking() {
        let mut csr = CsrFile::default();
        csr.update(CSR_MIE, u64::MAX, CsrOp::Write).unwrap();
        assert_eq!(csr.read(CSR_SIE).unwrap(), MIP_SSIP | MIP_STIP | MIP_SEIP);

        csr.update(CSR_SIP, u64::MAX, CsrOp::Write).unwrap();
        assert_eq!(csr.read(CSR_MIP).unwrap(), MIP_SSIP);
    }

    #[test]
    fn test_privilege_checks() {
        let mut csr = CsrFile::default();
        csr.set_mode(Mode::Supervisor);
        assert!(is_illegal(csr.read(CSR_MSTATUS)));
        assert!(csr.read(CSR_SSTATUS).is_ok());

        csr.set_mode(Mode::User);
        assert!(is_illegal(csr.read(CSR_SSTATUS)));
        assert!(csr.read(CSR_CYCLE).is_ok());
    }

    #[test]
    fn test_read_only_write_is_illegal() {
        let mut csr = CsrFile::default();
        assert!(csr.read(CSR_MHARTID).is_ok());
        assert!(is_illegal(csr.update(CSR_MHARTID, 1, CsrOp::Write)));
        assert!(is_illegal(csr.update(CSR_CYCLE, 1, CsrOp::Write)));
    }

    #[test]
    fn test_unknown_and_unsupported_csrs() {
        let csr = CsrFile::default();
        assert!(is_illegal(csr.read(0x5C0)));
        assert!(is_illegal(csr.read(CSR_PMPADDR16)));
        assert!(is_illegal(csr.read(CSR_MHPMCOUNTER3)));
        assert!(is_illegal(csr.read(0x3A1)));
        assert!(csr.read(CSR_PMPADDR0).is_ok());
        match csr.read(CSR_TSELECT) {
            Err(Trap::Fatal(FatalError::UnimplementedCsr(addr))) => assert_eq!(addr, CSR_TSELECT),
            other => panic!("expected fatal, got {:?}", other),
        }
    }

    #[test]
    fn test_counters_and_misa() {
        let mut csr = CsrFile::default();
        csr.retire();
        csr.retire();
        assert_eq!(csr.read(CSR_INSTRET).unwrap(), 2);
        assert_eq!(csr.read(CSR_MCOUNTEREN).unwrap(), 0x7);

        let misa = csr.read(CSR_MISA).unwrap();
        assert_eq!(misa >> 62, 2);
        assert_ne!(misa & (1 << (b'C' - b'A')), 0);
        csr.update(CSR_MISA, 0, CsrOp::Write).unwrap();
        assert_eq!(csr.read(CSR_MISA).unwrap(), misa);
    }

    #[test]
    fn test_fcsr_fields() {
        let mut csr = CsrFile::default();
        csr.update(CSR_FRM, 0b101, CsrOp::Write).unwrap();
        csr.update(CSR_FFLAGS, 0b10001, CsrOp::Write).unwrap();
        assert_eq!(csr.read(CSR_FCSR).unwrap(), (0b101 << 5) | 0b10001);
    }

    #[test]
    fn test_satp_warl() {
        let mut csr = CsrFile::default();
        csr.update(CSR_SATP, (8 << 60) | 0x1234, CsrOp::Write).unwrap();
        // Sv48 is not supported: the write is dropped.
        csr.update(CSR_SATP, 9 << 60, CsrOp::Write).unwrap();
        assert_eq!(csr.read(CSR_SATP).unwrap(), (8 << 60) | 0x1234);
    }
}
