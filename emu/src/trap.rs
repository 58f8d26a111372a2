use crate::csr::*;
use crate::decoder::Operation;
use crate::error::FatalError;
use crate::interrupt::Context;

/// Set in `mcause`/`scause` for interrupts.
pub const INTERRUPT_BIT: u64 = 1 << 63;

/// Synchronous, guest-visible exceptions. The payload is the value that
/// lands in `xtval`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Exception {
    InstructionAddressMisaligned(u64),
    InstructionAccessFault(u64),
    IllegalInstruction(u64),
    Breakpoint(u64),
    LoadAddressMisaligned(u64),
    LoadAccessFault(u64),
    StoreAddressMisaligned(u64),
    StoreAccessFault(u64),
    EnvironmentCallFromU,
    EnvironmentCallFromS,
    EnvironmentCallFromM,
    InstructionPageFault(u64),
    LoadPageFault(u64),
    StorePageFault(u64),
}

impl Exception {
    pub fn cause(&self) -> u64 {
        match self {
            Exception::InstructionAddressMisaligned(_) => 0,
            Exception::InstructionAccessFault(_) => 1,
            Exception::IllegalInstruction(_) => 2,
            Exception::Breakpoint(_) => 3,
            Exception::LoadAddressMisaligned(_) => 4,
            Exception::LoadAccessFault(_) => 5,
            Exception::StoreAddressMisaligned(_) => 6,
            Exception::StoreAccessFault(_) => 7,
            Exception::EnvironmentCallFromU => 8,
            Exception::EnvironmentCallFromS => 9,
            Exception::EnvironmentCallFromM => 11,
            Exception::InstructionPageFault(_) => 12,
            Exception::LoadPageFault(_) => 13,
            Exception::StorePageFault(_) => 15,
        }
    }

    pub fn tval(&self) -> u64 {
        match *self {
            Exception::InstructionAddressMisaligned(v)
            | Exception::InstructionAccessFault(v)
            | Exception::IllegalInstruction(v)
            | Exception::Breakpoint(v)
            | Exception::LoadAddressMisaligned(v)
            | Exception::LoadAccessFault(v)
            | Exception::StoreAddressMisaligned(v)
            | Exception::StoreAccessFault(v)
            | Exception::InstructionPageFault(v)
            | Exception::LoadPageFault(v)
            | Exception::StorePageFault(v) => v,
            Exception::EnvironmentCallFromU
            | Exception::EnvironmentCallFromS
            | Exception::EnvironmentCallFromM => 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupt {
    SupervisorSoftware,
    MachineSoftware,
    SupervisorTimer,
    MachineTimer,
    SupervisorExternal,
    MachineExternal,
}

impl Interrupt {
    /// Highest priority first.
    const PRIORITY: [Interrupt; 6] = [
        Interrupt::MachineExternal,
        Interrupt::MachineSoftware,
        Interrupt::MachineTimer,
        Interrupt::SupervisorExternal,
        Interrupt::SupervisorSoftware,
        Interrupt::SupervisorTimer,
    ];

    pub fn code(self) -> u64 {
        match self {
            Interrupt::SupervisorSoftware => 1,
            Interrupt::MachineSoftware => 3,
            Interrupt::SupervisorTimer => 5,
            Interrupt::MachineTimer => 7,
            Interrupt::SupervisorExternal => 9,
            Interrupt::MachineExternal => 11,
        }
    }

    pub fn cause(self) -> u64 {
        INTERRUPT_BIT | self.code()
    }

    fn mip_bit(self) -> u64 {
        1 << self.code()
    }
}

/// The hart's view of its interrupt lines. Polled once per cycle.
pub trait InterruptSource {
    /// External interrupt pending for the given aggregator context.
    fn poll_external(&self, context: Context) -> bool;
    fn poll_timer(&self) -> bool;
    fn poll_software(&self) -> bool {
        false
    }
}

fn delegated(csr: &CsrFile, cause: u64) -> bool {
    if csr.mode() == Mode::Machine {
        return false;
    }
    let code = cause & !INTERRUPT_BIT;
    if code >= 64 {
        return false;
    }
    let deleg = if cause & INTERRUPT_BIT != 0 {
        csr.get(CSR_MIDELEG)
    } else {
        csr.get(CSR_MEDELEG)
    };
    (deleg >> code) & 1 == 1
}

fn vector(tvec: u64, cause: u64) -> u64 {
    let base = tvec & !0b11;
    if cause & INTERRUPT_BIT != 0 && tvec & 0b11 == 1 {
        base.wrapping_add(4 * (cause & !INTERRUPT_BIT))
    } else {
        base
    }
}

/// Enter a trap taken at `pc`. Updates the status and cause CSRs, switches
/// privilege and returns the handler address.
pub fn trap_enter(csr: &mut CsrFile, pc: u64, cause: u64, tval: u64) -> u64 {
    let from = csr.mode();
    let mut mstatus = csr.get(CSR_MSTATUS);

    let target = if delegated(csr, cause) {
        csr.set(CSR_SEPC, pc);
        csr.set(CSR_SCAUSE, cause);
        csr.set(CSR_STVAL, tval);

        let sie = mstatus & MSTATUS_SIE != 0;
        mstatus &= !(MSTATUS_SPIE | MSTATUS_SIE | MSTATUS_SPP);
        if sie {
            mstatus |= MSTATUS_SPIE;
        }
        if from == Mode::Supervisor {
            mstatus |= MSTATUS_SPP;
        }
        csr.set(CSR_MSTATUS, mstatus);
        csr.set_mode(Mode::Supervisor);
        vector(csr.get(CSR_STVEC), cause)
    } else {
        csr.set(CSR_MEPC, pc);
        csr.set(CSR_MCAUSE, cause);
        csr.set(CSR_MTVAL, tval);

        let mie = mstatus & MSTATUS_MIE != 0;
        mstatus &= !(MSTATUS_MPIE | MSTATUS_MIE | MSTATUS_MPP);
        if mie {
            mstatus |= MSTATUS_MPIE;
        }
        mstatus |= from.to_mpp() << MSTATUS_MPP_SHIFT;
        csr.set(CSR_MSTATUS, mstatus);
        csr.set_mode(Mode::Machine);
        vector(csr.get(CSR_MTVEC), cause)
    };

    log::debug!(
        "trap: cause={:#x} tval={:#x} pc={:#x} {:?} -> {:?} handler={:#x}",
        cause,
        tval,
        pc,
        from,
        csr.mode(),
        target
    );
    target
}

/// Return from a trap handler via `SRET` or `MRET`, restoring privilege and
/// interrupt enables. Returns the new pc.
pub fn trap_exit(csr: &mut CsrFile, op: Operation) -> Result<u64, FatalError> {
    let mut mstatus = csr.get(CSR_MSTATUS);
    let (mode, pc) = match op {
        Operation::Sret => {
            let mode = if mstatus & MSTATUS_SPP != 0 {
                Mode::Supervisor
            } else {
                Mode::User
            };
            let spie = mstatus & MSTATUS_SPIE != 0;
            mstatus &= !(MSTATUS_SIE | MSTATUS_SPP);
            if spie {
                mstatus |= MSTATUS_SIE;
            }
            mstatus |= MSTATUS_SPIE;
            (mode, csr.get(CSR_SEPC))
        }
        Operation::Mret => {
            let mode = Mode::from_mpp(mstatus >> MSTATUS_MPP_SHIFT);
            let mpie = mstatus & MSTATUS_MPIE != 0;
            mstatus &= !(MSTATUS_MIE | MSTATUS_MPP);
            if mpie {
                mstatus |= MSTATUS_MIE;
            }
            mstatus |= MSTATUS_MPIE;
            (mode, csr.get(CSR_MEPC))
        }
        other => return Err(FatalError::BadTrapExit(other)),
    };
    if mode != Mode::Machine {
        mstatus &= !MSTATUS_MPRV;
    }
    csr.set(CSR_MSTATUS, mstatus);

    log::debug!("{}: {:?} -> {:?} pc={:#x}", op, csr.mode(), mode, pc);
    csr.set_mode(mode);
    Ok(pc)
}

/// The highest-priority interrupt that is pending, enabled and allowed to
/// preempt the current privilege level.
pub fn pending_interrupt(csr: &CsrFile) -> Option<Interrupt> {
    let mstatus = csr.get(CSR_MSTATUS);
    let pending = csr.get(CSR_MIP) & csr.get(CSR_MIE);
    if pending == 0 {
        return None;
    }
    let mideleg = csr.get(CSR_MIDELEG);

    let m_enabled = match csr.mode() {
        Mode::Machine => mstatus & MSTATUS_MIE != 0,
        _ => true,
    };
    let s_enabled = match csr.mode() {
        Mode::Machine => false,
        Mode::Supervisor => mstatus & MSTATUS_SIE != 0,
        Mode::User => true,
    };

    let m_pending = if m_enabled { pending & !mideleg } else { 0 };
    let s_pending = if s_enabled { pending & mideleg } else { 0 };
    let takeable = m_pending | s_pending;

    Interrupt::PRIORITY
        .iter()
        .copied()
        .find(|irq| takeable & irq.mip_bit() != 0)
}

/// Refresh the hardware-driven `mip` bits from the platform and take the
/// highest-priority eligible interrupt. Returns the pc to fetch from, which
/// is `pc` itself when nothing is taken.
pub fn handle_interrupt(csr: &mut CsrFile, pc: u64, source: &dyn InterruptSource) -> u64 {
    let mut hw_mask = MIP_MEIP | MIP_SEIP | MIP_MTIP | MIP_MSIP;
    let mut hw = 0;
    if source.poll_external(Context::Machine) {
        hw |= MIP_MEIP;
    }
    if source.poll_external(Context::Supervisor) {
        hw |= MIP_SEIP;
    }
    if source.poll_timer() {
        hw |= MIP_MTIP;
    }
    if source.poll_software() {
        hw |= MIP_MSIP;
    }
    // Sstc: STIP follows stimecmp instead of being written by M-mode.
    if csr.get(CSR_MENVCFG) & MENVCFG_STCE != 0 {
        hw_mask |= MIP_STIP;
        if csr.timebase().now() >= csr.get(CSR_STIMECMP) {
            hw |= MIP_STIP;
        }
    }
    let mip = csr.get(CSR_MIP);
    csr.set(CSR_MIP, (mip & !hw_mask) | hw);

    match pending_interrupt(csr) {
        Some(irq) => {
            if log::log_enabled!(log::Level::Trace) {
                log::trace!(
                    "interrupt {:?}: mip={:#x} mie={:#x} mode={:?}",
                    irq,
                    csr.get(CSR_MIP),
                    csr.get(CSR_MIE),
                    csr.mode()
                );
            }
            trap_enter(csr, pc, irq.cause(), 0)
        }
        None => pc,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Default)]
    struct Lines {
        m_external: bool,
        s_external: bool,
        timer: bool,
        software: bool,
    }

    impl InterruptSource for Lines {
        fn poll_external(&self, context: Context) -> bool {
            match context {
                Context::Machine => self.m_external,
                Context::Supervisor => self.s_external,
            }
        }

        fn poll_timer(&self) -> bool {
            self.timer
        }

        fn poll_software(&self) -> bool {
            self.software
        }
    }

    #[test]
    fn test_delegated_trap_and_sret_roundtrip() {
        let mut csr = CsrFile::default();
        csr.set(CSR_MEDELEG, 1 << 8);
        csr.set(CSR_STVEC, 0x8000_1000);
        csr.set(CSR_MTVEC, 0x8000_2000);
        csr.set(CSR_MSTATUS, csr.get(CSR_MSTATUS) | MSTATUS_SIE);
        csr.set_mode(Mode::User);

        let ecall = Exception::EnvironmentCallFromU;
        let handler = trap_enter(&mut csr, 0x1234, ecall.cause(), ecall.tval());
        assert_eq!(handler, 0x8000_1000);
        assert_eq!(csr.mode(), Mode::Supervisor);
        assert_eq!(csr.get(CSR_SEPC), 0x1234);
        assert_eq!(csr.get(CSR_SCAUSE), 8);
        let mstatus = csr.get(CSR_MSTATUS);
        assert_eq!(mstatus & MSTATUS_SPP, 0);
        assert_ne!(mstatus & MSTATUS_SPIE, 0);
        assert_eq!(mstatus & MSTATUS_SIE, 0);
        // M-mode registers untouched.
        assert_eq!(csr.get(CSR_MEPC), 0);

        let pc = trap_exit(&mut csr, Operation::Sret).unwrap();
        assert_eq!(pc, 0x1234);
        assert_eq!(csr.mode(), Mode::User);
        assert_ne!(csr.get(CSR_MSTATUS) & MSTATUS_SIE, 0);
    }

    #[test]
    fn test_machine_trap_records_two_bit_mpp() {
        let mut csr = CsrFile::default();
        csr.set(CSR_MTVEC, 0x100);
        csr.set_mode(Mode::Supervisor);

        let fault = Exception::LoadPageFault(0xdead_b000);
        let handler = trap_enter(&mut csr, 0x4000, fault.cause(), fault.tval());
        assert_eq!(handler, 0x100);
        assert_eq!(csr.mode(), Mode::Machine);
        assert_eq!(csr.get(CSR_MCAUSE), 13);
        assert_eq!(csr.get(CSR_MTVAL), 0xdead_b000);
        assert_eq!((csr.get(CSR_MSTATUS) & MSTATUS_MPP) >> MSTATUS_MPP_SHIFT, 0b01);

        let pc = trap_exit(&mut csr, Operation::Mret).unwrap();
        assert_eq!(pc, 0x4000);
        assert_eq!(csr.mode(), Mode::Supervisor);
        assert_eq!(csr.get(CSR_MSTATUS) & MSTATUS_MPP, 0);
    }

    #[test]
    fn test_machine_mode_never_delegates() {
        let mut csr = CsrFile::default();
        csr.set(CSR_MEDELEG, !0);
        csr.set(CSR_MTVEC, 0x200);
        csr.set(CSR_STVEC, 0x300);
        let handler = trap_enter(&mut csr, 0, Exception::Breakpoint(0).cause(), 0);
        assert_eq!(handler, 0x200);
        assert_eq!(csr.mode(), Mode::Machine);
        assert_eq!((csr.get(CSR_MSTATUS) & MSTATUS_MPP) >> MSTATUS_MPP_SHIFT, 0b11);
    }

    #[test]
    fn test_trap_exit_rejects_other_ops() {
        let mut csr = CsrFile::default();
        match trap_exit(&mut csr, Operation::Ecall) {
            Err(FatalError::BadTrapExit(Operation::Ecall)) => {}
            other => panic!("expected BadTrapExit, got {:?}", other),
        }
    }

    #[test]
    fn test_vectored_interrupt_entry() {
        let mut csr = CsrFile::default();
        csr.set(CSR_MTVEC, 0x1000 | 1);
        csr.set(CSR_MIE, MIP_MTIP);
        csr.set(CSR_MSTATUS, csr.get(CSR_MSTATUS) | MSTATUS_MIE);

        let lines = Lines {
            timer: true,
            ..Default::default()
        };
        let pc = handle_interrupt(&mut csr, 0x8000_0000, &lines);
        assert_eq!(pc, 0x1000 + 4 * 7);
        assert_eq!(csr.get(CSR_MCAUSE), INTERRUPT_BIT | 7);
        assert_eq!(csr.get(CSR_MEPC), 0x8000_0000);
        // Exceptions ignore the vector table.
        csr.set_mode(Mode::Machine);
        assert_eq!(trap_enter(&mut csr, 0, 2, 0), 0x1000);
    }

    #[test]
    fn test_interrupt_masked_returns_pc() {
        let mut csr = CsrFile::default();
        csr.set(CSR_MIE, MIP_MTIP);
        let lines = Lines {
            timer: true,
            ..Default::default()
        };
        // MSTATUS.MIE is clear in M-mode.
        assert_eq!(handle_interrupt(&mut csr, 0x80, &lines), 0x80);
        assert_ne!(csr.get(CSR_MIP) & MIP_MTIP, 0);

        // The line dropping clears MTIP again.
        assert_eq!(handle_interrupt(&mut csr, 0x80, &Lines::default()), 0x80);
        assert_eq!(csr.get(CSR_MIP) & MIP_MTIP, 0);
    }

    #[test]
    fn test_interrupt_priority_order() {
        let mut csr = CsrFile::default();
        csr.set(CSR_MIE, MIP_MEIP | MIP_MSIP | MIP_MTIP);
        csr.set_mode(Mode::User);
        csr.set(CSR_MIP, MIP_MSIP | MIP_MTIP);
        assert_eq!(pending_interrupt(&csr), Some(Interrupt::MachineSoftware));
        csr.set(CSR_MIP, MIP_MSIP | MIP_MTIP | MIP_MEIP);
        assert_eq!(pending_interrupt(&csr), Some(Interrupt::MachineExternal));
    }

    #[test]
    fn test_delegated_external_interrupt_goes_to_supervisor() {
        let mut csr = CsrFile::default();
        csr.set(CSR_MIDELEG, MIP_SEIP);
        csr.set(CSR_MIE, MIP_SEIP);
        csr.set(CSR_STVEC, 0xC000);
        csr.set_mode(Mode::User);

        let lines = Lines {
            s_external: true,
            ..Default::default()
        };
        assert_eq!(handle_interrupt(&mut csr, 0x10, &lines), 0xC000);
        assert_eq!(csr.mode(), Mode::Supervisor);
        assert_eq!(csr.get(CSR_SCAUSE), INTERRUPT_BIT | 9);
        assert_eq!(csr.get(CSR_SEPC), 0x10);

        // Now in S with SIE clear: the same line no longer preempts.
        assert_eq!(handle_interrupt(&mut csr, 0xC000, &lines), 0xC000);
    }

    #[test]
    fn test_sstc_raises_stip() {
        let mut csr = CsrFile::default();
        csr.set(CSR_MENVCFG, MENVCFG_STCE);
        csr.set(CSR_STIMECMP, 0);
        csr.set(CSR_MIDELEG, MIP_STIP);
        csr.set(CSR_MIE, MIP_STIP);
        csr.set(CSR_STVEC, 0x5000);
        csr.set(CSR_MSTATUS, csr.get(CSR_MSTATUS) | MSTATUS_SIE);
        csr.set_mode(Mode::Supervisor);

        assert_eq!(handle_interrupt(&mut csr, 0x20, &Lines::default()), 0x5000);
        assert_eq!(csr.get(CSR_SCAUSE), INTERRUPT_BIT | 5);

        // Pushing the deadline out clears STIP on the next poll.
        csr.set(CSR_STIMECMP, u64::MAX);
        handle_interrupt(&mut csr, 0x5000, &Lines::default());
        assert_eq!(csr.get(CSR_MIP) & MIP_STIP, 0);
    }
}
