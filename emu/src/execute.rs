use crate::address_space::{AccessSize, AddressSpace, Rmw};
use crate::cpu::CpuState;
use crate::csr::*;
use crate::decoder::{DecodedInstruction, Operation};
use crate::error::FatalError;
use crate::trap::{trap_exit, Exception};
use crate::Trap;

/// Execute one decoded instruction at `cpu.pc` and return the next pc.
///
/// Guest exceptions are taken here: the returned pc is then the trap
/// handler. Only emulator-fatal conditions come back as `Err`.
pub fn execute(
    cpu: &mut CpuState,
    bus: &mut AddressSpace,
    insn: &DecodedInstruction,
) -> Result<u64, FatalError> {
    let pc = cpu.pc;
    match exec(cpu, bus, insn, pc) {
        Ok(next) => {
            cpu.csr.retire();
            Ok(next)
        }
        Err(Trap::Exception(e)) => {
            let e = match e {
                Exception::IllegalInstruction(_) => Exception::IllegalInstruction(insn.raw as u64),
                other => other,
            };
            Ok(cpu.take_exception(pc, e))
        }
        Err(Trap::Fatal(e)) => Err(e),
    }
}

#[inline]
fn sext32(value: u64) -> u64 {
    value as i32 as i64 as u64
}

fn illegal() -> Trap {
    Exception::IllegalInstruction(0).into()
}

fn branch(taken: bool, pc: u64, imm: u64, next: u64) -> u64 {
    if taken {
        pc.wrapping_add(imm)
    } else {
        next
    }
}

fn store(
    cpu: &mut CpuState,
    bus: &mut AddressSpace,
    addr: u64,
    size: AccessSize,
    value: u64,
    next: u64,
) -> Result<u64, Trap> {
    cpu.store(bus, addr, size, value)?;
    Ok(next)
}

fn amo(
    cpu: &mut CpuState,
    bus: &mut AddressSpace,
    addr: u64,
    size: AccessSize,
    data: u64,
    rmw: Rmw,
) -> Result<u64, Trap> {
    let old = cpu.amo(bus, addr, size, data, rmw)?;
    Ok(size.sign_extend(old))
}

fn csr_access(
    cpu: &mut CpuState,
    addr: u16,
    op: CsrOp,
    operand: u64,
    writes: bool,
) -> Result<u64, Trap> {
    if !writes {
        return cpu.csr.read(addr);
    }
    // CSRRW with rd == x0 still goes through the read: it performs the
    // address and privilege checks, and no CSR read has side effects.
    let mode = cpu.csr.mode();
    if addr == CSR_SATP && mode == Mode::Supervisor && cpu.csr.get(CSR_MSTATUS) & MSTATUS_TVM != 0 {
        return Err(illegal());
    }
    cpu.csr.update(addr, operand, op)
}

fn require_fp(cpu: &CpuState) -> Result<(), Trap> {
    if cpu.csr.get(CSR_MSTATUS) & MSTATUS_FS == 0 {
        return Err(illegal());
    }
    Ok(())
}

fn mark_fp_dirty(cpu: &mut CpuState) {
    let mstatus = cpu.csr.get(CSR_MSTATUS);
    cpu.csr.set(CSR_MSTATUS, mstatus | MSTATUS_FS);
}

fn div(a: i64, b: i64) -> u64 {
    if b == 0 {
        u64::MAX
    } else {
        a.wrapping_div(b) as u64
    }
}

fn rem(a: i64, b: i64) -> u64 {
    if b == 0 {
        a as u64
    } else {
        a.wrapping_rem(b) as u64
    }
}

fn exec(
    cpu: &mut CpuState,
    bus: &mut AddressSpace,
    insn: &DecodedInstruction,
    pc: u64,
) -> Result<u64, Trap> {
    use Operation::*;

    let next = pc.wrapping_add(insn.len as u64);
    let rd = insn.rd;
    let rs1 = cpu.regs.read(insn.rs1);
    let rs2 = cpu.regs.read(insn.rs2);
    let imm = insn.imm;
    let addr = rs1.wrapping_add(imm);
    let mode = cpu.csr.mode();

    let result = match insn.op {
        Lui => imm,
        Auipc => pc.wrapping_add(imm),
        Jal => {
            cpu.regs.write(rd, next);
            return Ok(pc.wrapping_add(imm));
        }
        Jalr => {
            let target = addr & !1;
            cpu.regs.write(rd, next);
            return Ok(target);
        }

        Beq => return Ok(branch(rs1 == rs2, pc, imm, next)),
        Bne => return Ok(branch(rs1 != rs2, pc, imm, next)),
        Blt => return Ok(branch((rs1 as i64) < (rs2 as i64), pc, imm, next)),
        Bge => return Ok(branch((rs1 as i64) >= (rs2 as i64), pc, imm, next)),
        Bltu => return Ok(branch(rs1 < rs2, pc, imm, next)),
        Bgeu => return Ok(branch(rs1 >= rs2, pc, imm, next)),

        Lb => AccessSize::Byte.sign_extend(cpu.load(bus, addr, AccessSize::Byte)?),
        Lh => AccessSize::Half.sign_extend(cpu.load(bus, addr, AccessSize::Half)?),
        Lw => AccessSize::Word.sign_extend(cpu.load(bus, addr, AccessSize::Word)?),
        Ld => cpu.load(bus, addr, AccessSize::Double)?,
        Lbu => cpu.load(bus, addr, AccessSize::Byte)?,
        Lhu => cpu.load(bus, addr, AccessSize::Half)?,
        Lwu => cpu.load(bus, addr, AccessSize::Word)?,

        Sb => return store(cpu, bus, addr, AccessSize::Byte, rs2, next),
        Sh => return store(cpu, bus, addr, AccessSize::Half, rs2, next),
        Sw => return store(cpu, bus, addr, AccessSize::Word, rs2, next),
        Sd => return store(cpu, bus, addr, AccessSize::Double, rs2, next),

        Addi => rs1.wrapping_add(imm),
        Slti => ((rs1 as i64) < (imm as i64)) as u64,
        Sltiu => (rs1 < imm) as u64,
        Xori => rs1 ^ imm,
        Ori => rs1 | imm,
        Andi => rs1 & imm,
        Slli => rs1 << (imm & 0x3F),
        Srli => rs1 >> (imm & 0x3F),
        Srai => ((rs1 as i64) >> (imm & 0x3F)) as u64,

        Add => rs1.wrapping_add(rs2),
        Sub => rs1.wrapping_sub(rs2),
        Sll => rs1 << (rs2 & 0x3F),
        Slt => ((rs1 as i64) < (rs2 as i64)) as u64,
        Sltu => (rs1 < rs2) as u64,
        Xor => rs1 ^ rs2,
        Srl => rs1 >> (rs2 & 0x3F),
        Sra => ((rs1 as i64) >> (rs2 & 0x3F)) as u64,
        Or => rs1 | rs2,
        And => rs1 & rs2,

        Addiw => sext32(rs1.wrapping_add(imm)),
        Slliw => sext32(((rs1 as u32) << (imm & 0x1F)) as u64),
        Srliw => sext32(((rs1 as u32) >> (imm & 0x1F)) as u64),
        Sraiw => ((rs1 as i32) >> (imm & 0x1F)) as i64 as u64,
        Addw => sext32(rs1.wrapping_add(rs2)),
        Subw => sext32(rs1.wrapping_sub(rs2)),
        Sllw => sext32(((rs1 as u32) << (rs2 & 0x1F)) as u64),
        Srlw => sext32(((rs1 as u32) >> (rs2 & 0x1F)) as u64),
        Sraw => ((rs1 as i32) >> (rs2 & 0x1F)) as i64 as u64,

        Mul => rs1.wrapping_mul(rs2),
        Mulh => ((rs1 as i64 as i128 * rs2 as i64 as i128) >> 64) as u64,
        Mulhsu => ((rs1 as i64 as i128 * rs2 as i128) >> 64) as u64,
        Mulhu => ((rs1 as u128 * rs2 as u128) >> 64) as u64,
        Div => div(rs1 as i64, rs2 as i64),
        Divu => rs1.checked_div(rs2).unwrap_or(u64::MAX),
        Rem => rem(rs1 as i64, rs2 as i64),
        Remu => rs1.checked_rem(rs2).unwrap_or(rs1),
        Mulw => sext32(rs1.wrapping_mul(rs2)),
        Divw => {
            let (a, b) = (rs1 as i32, rs2 as i32);
            if b == 0 {
                u64::MAX
            } else {
                a.wrapping_div(b) as i64 as u64
            }
        }
        Divuw => {
            let (a, b) = (rs1 as u32, rs2 as u32);
            match a.checked_div(b) {
                Some(q) => sext32(q as u64),
                None => u64::MAX,
            }
        }
        Remw => {
            let (a, b) = (rs1 as i32, rs2 as i32);
            if b == 0 {
                a as i64 as u64
            } else {
                a.wrapping_rem(b) as i64 as u64
            }
        }
        Remuw => {
            let (a, b) = (rs1 as u32, rs2 as u32);
            sext32(a.checked_rem(b).unwrap_or(a) as u64)
        }

        LrW => AccessSize::Word.sign_extend(cpu.load_reserved(bus, addr, AccessSize::Word)?),
        LrD => cpu.load_reserved(bus, addr, AccessSize::Double)?,
        ScW => cpu.store_conditional(bus, addr, AccessSize::Word, rs2)?,
        ScD => cpu.store_conditional(bus, addr, AccessSize::Double, rs2)?,
        AmoswapW => amo(cpu, bus, addr, AccessSize::Word, rs2, Rmw::Swap)?,
        AmoaddW => amo(cpu, bus, addr, AccessSize::Word, rs2, Rmw::Add)?,
        AmoxorW => amo(cpu, bus, addr, AccessSize::Word, rs2, Rmw::Xor)?,
        AmoandW => amo(cpu, bus, addr, AccessSize::Word, rs2, Rmw::And)?,
        AmoorW => amo(cpu, bus, addr, AccessSize::Word, rs2, Rmw::Or)?,
        AmominW => amo(cpu, bus, addr, AccessSize::Word, rs2, Rmw::Min)?,
        AmomaxW => amo(cpu, bus, addr, AccessSize::Word, rs2, Rmw::Max)?,
        AmominuW => amo(cpu, bus, addr, AccessSize::Word, rs2, Rmw::MinU)?,
        AmomaxuW => amo(cpu, bus, addr, AccessSize::Word, rs2, Rmw::MaxU)?,
        AmoswapD => amo(cpu, bus, addr, AccessSize::Double, rs2, Rmw::Swap)?,
        AmoaddD => amo(cpu, bus, addr, AccessSize::Double, rs2, Rmw::Add)?,
        AmoxorD => amo(cpu, bus, addr, AccessSize::Double, rs2, Rmw::Xor)?,
        AmoandD => amo(cpu, bus, addr, AccessSize::Double, rs2, Rmw::And)?,
        AmoorD => amo(cpu, bus, addr, AccessSize::Double, rs2, Rmw::Or)?,
        AmominD => amo(cpu, bus, addr, AccessSize::Double, rs2, Rmw::Min)?,
        AmomaxD => amo(cpu, bus, addr, AccessSize::Double, rs2, Rmw::Max)?,
        AmominuD => amo(cpu, bus, addr, AccessSize::Double, rs2, Rmw::MinU)?,
        AmomaxuD => amo(cpu, bus, addr, AccessSize::Double, rs2, Rmw::MaxU)?,

        Csrrw => csr_access(cpu, insn.csr, CsrOp::Write, rs1, true)?,
        Csrrs => csr_access(cpu, insn.csr, CsrOp::Set, rs1, insn.rs1 != 0)?,
        Csrrc => csr_access(cpu, insn.csr, CsrOp::Clear, rs1, insn.rs1 != 0)?,
        Csrrwi => csr_access(cpu, insn.csr, CsrOp::Write, imm, true)?,
        Csrrsi => csr_access(cpu, insn.csr, CsrOp::Set, imm, imm != 0)?,
        Csrrci => csr_access(cpu, insn.csr, CsrOp::Clear, imm, imm != 0)?,

        Fence | FenceI | Wfi => return Ok(next),
        SfenceVma => {
            let tvm = cpu.csr.get(CSR_MSTATUS) & MSTATUS_TVM != 0;
            if mode == Mode::User || (mode == Mode::Supervisor && tvm) {
                return Err(illegal());
            }
            return Ok(next);
        }
        Ecall => {
            return Err(match mode {
                Mode::User => Exception::EnvironmentCallFromU,
                Mode::Supervisor => Exception::EnvironmentCallFromS,
                Mode::Machine => Exception::EnvironmentCallFromM,
            }
            .into())
        }
        Ebreak => return Err(Exception::Breakpoint(pc).into()),
        // misa does not advertise N.
        Uret => return Err(illegal()),
        Sret => {
            let tsr = cpu.csr.get(CSR_MSTATUS) & MSTATUS_TSR != 0;
            if mode == Mode::User || (mode == Mode::Supervisor && tsr) {
                return Err(illegal());
            }
            cpu.reservation = None;
            return Ok(trap_exit(&mut cpu.csr, Sret)?);
        }
        Mret => {
            if mode != Mode::Machine {
                return Err(illegal());
            }
            cpu.reservation = None;
            return Ok(trap_exit(&mut cpu.csr, Mret)?);
        }

        Flw => {
            require_fp(cpu)?;
            let bits = cpu.load(bus, addr, AccessSize::Word)?;
            cpu.regs.write_f32(rd, bits as u32);
            mark_fp_dirty(cpu);
            return Ok(next);
        }
        Fld => {
            require_fp(cpu)?;
            let bits = cpu.load(bus, addr, AccessSize::Double)?;
            cpu.regs.write_f(rd, bits);
            mark_fp_dirty(cpu);
            return Ok(next);
        }
        Fsw => {
            require_fp(cpu)?;
            let bits = cpu.regs.read_f(insn.rs2);
            return store(cpu, bus, addr, AccessSize::Word, bits, next);
        }
        Fsd => {
            require_fp(cpu)?;
            let bits = cpu.regs.read_f(insn.rs2);
            return store(cpu, bus, addr, AccessSize::Double, bits, next);
        }
        FmvXW => {
            require_fp(cpu)?;
            sext32(cpu.regs.read_f(insn.rs1))
        }
        FmvXD => {
            require_fp(cpu)?;
            cpu.regs.read_f(insn.rs1)
        }
        FmvWX => {
            require_fp(cpu)?;
            cpu.regs.write_f32(rd, rs1 as u32);
            mark_fp_dirty(cpu);
            return Ok(next);
        }
        FmvDX => {
            require_fp(cpu)?;
            cpu.regs.write_f(rd, rs1);
            mark_fp_dirty(cpu);
            return Ok(next);
        }
    };

    cpu.regs.write(rd, result);
    Ok(next)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::decoder::decode;
    use crate::memory::{Ram, RAM_BASE};
    use crate::timer::Timebase;

    fn encode_r(funct7: u32, rs2: u32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
        (funct7 << 25) | (rs2 << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | opcode
    }

    fn encode_i(imm: i32, rs1: u32, funct3: u32, rd: u32, opcode: u32) -> u32 {
        (((imm as u32) & 0xFFF) << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | opcode
    }

    fn encode_s(imm: i32, rs2: u32, rs1: u32, funct3: u32, opcode: u32) -> u32 {
        let imm = imm as u32;
        (((imm >> 5) & 0x7F) << 25)
            | (rs2 << 20)
            | (rs1 << 15)
            | (funct3 << 12)
            | ((imm & 0x1F) << 7)
            | opcode
    }

    fn encode_amo(funct5: u32, rs2: u32, rs1: u32, funct3: u32, rd: u32) -> u32 {
        encode_r(funct5 << 2, rs2, rs1, funct3, rd, 0x2F)
    }

    fn encode_csr(csr: u16, rs1: u32, funct3: u32, rd: u32) -> u32 {
        ((csr as u32) << 20) | (rs1 << 15) | (funct3 << 12) | (rd << 7) | 0x73
    }

    fn make_space() -> AddressSpace {
        let mut bus = AddressSpace::new(0, 0x7F_FFFF_FFFF);
        bus.attach(
            AddressSpace::ROOT,
            "ram",
            RAM_BASE,
            RAM_BASE + 0x1_0000 - 1,
            Ram::new(0x1_0000),
        );
        bus
    }

    fn make_cpu() -> CpuState {
        let mut cpu = CpuState::new(RAM_BASE, Timebase::default());
        cpu.csr.set(CSR_MTVEC, RAM_BASE + 0x8000);
        cpu.csr.set(CSR_STVEC, RAM_BASE + 0x9000);
        cpu
    }

    fn run(cpu: &mut CpuState, bus: &mut AddressSpace, raw: u32) {
        let insn = decode(raw).unwrap();
        cpu.pc = execute(cpu, bus, &insn).unwrap();
    }

    /// rd = x3, rs1 = x1, rs2 = x2.
    fn alu(op: (u32, u32, u32), a: u64, b: u64) -> u64 {
        let mut bus = make_space();
        let mut cpu = make_cpu();
        cpu.regs.write(1, a);
        cpu.regs.write(2, b);
        let (funct7, funct3, opcode) = op;
        run(&mut cpu, &mut bus, encode_r(funct7, 2, 1, funct3, 3, opcode));
        cpu.regs.read(3)
    }

    const DIV: (u32, u32, u32) = (1, 4, 0x33);
    const DIVU: (u32, u32, u32) = (1, 5, 0x33);
    const REM: (u32, u32, u32) = (1, 6, 0x33);
    const REMU: (u32, u32, u32) = (1, 7, 0x33);
    const DIVW: (u32, u32, u32) = (1, 4, 0x3B);
    const REMW: (u32, u32, u32) = (1, 6, 0x3B);
    const DIVUW: (u32, u32, u32) = (1, 5, 0x3B);
    const MULH: (u32, u32, u32) = (1, 1, 0x33);
    const MULHSU: (u32, u32, u32) = (1, 2, 0x33);
    const MULHU: (u32, u32, u32) = (1, 3, 0x33);
    const ADDW: (u32, u32, u32) = (0, 0, 0x3B);
    const SLL: (u32, u32, u32) = (0, 1, 0x33);
    const SRA: (u32, u32, u32) = (0x20, 5, 0x33);
    const SRAW: (u32, u32, u32) = (0x20, 5, 0x3B);
    const SLT: (u32, u32, u32) = (0, 2, 0x33);
    const SLTU: (u32, u32, u32) = (0, 3, 0x33);

    #[test]
    fn test_division_edge_cases() {
        let min = i64::MIN as u64;
        let minus_one = -1i64 as u64;
        assert_eq!(alu(DIV, 42, 0), u64::MAX);
        assert_eq!(alu(DIV, min, minus_one), min);
        assert_eq!(alu(DIV, -7i64 as u64, 2), -3i64 as u64);
        assert_eq!(alu(REM, 42, 0), 42);
        assert_eq!(alu(REM, min, minus_one), 0);
        assert_eq!(alu(REM, -7i64 as u64, 2), -1i64 as u64);
        assert_eq!(alu(DIVU, 42, 0), u64::MAX);
        assert_eq!(alu(REMU, 42, 0), 42);
        assert_eq!(alu(DIVW, 5, 0), u64::MAX);
        assert_eq!(alu(DIVW, i32::MIN as u32 as u64, minus_one), i32::MIN as i64 as u64);
        assert_eq!(alu(REMW, 0xFFFF_FFFF_8000_0000, 0), 0xFFFF_FFFF_8000_0000);
        assert_eq!(alu(REMW, i32::MIN as u32 as u64, minus_one), 0);
        assert_eq!(alu(DIVUW, 0xFFFF_FFFE, 1), 0xFFFF_FFFF_FFFF_FFFE);
    }

    #[test]
    fn test_multiply_high() {
        let minus_one = -1i64 as u64;
        assert_eq!(alu(MULH, minus_one, minus_one), 0);
        assert_eq!(alu(MULHU, u64::MAX, u64::MAX), u64::MAX - 1);
        assert_eq!(alu(MULHSU, minus_one, u64::MAX), u64::MAX);
        assert_eq!(alu(MULH, 1 << 62, 4), 1);
    }

    #[test]
    fn test_word_ops_and_shifts() {
        assert_eq!(alu(ADDW, 0x7FFF_FFFF, 1), 0xFFFF_FFFF_8000_0000);
        assert_eq!(alu(ADDW, 0xFFFF_FFFF_0000_0001, 1), 2);
        // Shift amounts use the low six (or five) bits.
        assert_eq!(alu(SLL, 1, 65), 2);
        assert_eq!(alu(SRA, 0x8000_0000_0000_0000, 63), u64::MAX);
        assert_eq!(alu(SRAW, 0x8000_0000, 33), 0xFFFF_FFFF_C000_0000);
        assert_eq!(alu(SLT, -1i64 as u64, 0), 1);
        assert_eq!(alu(SLTU, -1i64 as u64, 0), 0);
    }

    #[test]
    fn test_jalr_masks_low_bit_and_links() {
        let mut bus = make_space();
        let mut cpu = make_cpu();
        cpu.regs.write(1, RAM_BASE + 0x101);
        // jalr x5, 2(x1)
        run(&mut cpu, &mut bus, encode_i(2, 1, 0, 5, 0x67));
        assert_eq!(cpu.pc, RAM_BASE + 0x102);
        assert_eq!(cpu.regs.read(5), RAM_BASE + 4);
    }

    #[test]
    fn test_branches() {
        let mut bus = make_space();
        let mut cpu = make_cpu();
        cpu.regs.write(1, -1i64 as u64);
        cpu.regs.write(2, 1);
        // blt x1, x2, +16 (taken: -1 < 1)
        run(&mut cpu, &mut bus, 0x0020_C863);
        assert_eq!(cpu.pc, RAM_BASE + 16);
        // bltu x1, x2, +16 (not taken unsigned)
        run(&mut cpu, &mut bus, 0x0020_E863);
        assert_eq!(cpu.pc, RAM_BASE + 20);
    }

    #[test]
    fn test_load_sign_and_zero_extension() {
        let mut bus = make_space();
        let mut cpu = make_cpu();
        let addr = RAM_BASE + 0x100;
        bus.write(addr, AccessSize::Double, 0xFFEE_DDCC_BBAA_9988, Rmw::None)
            .unwrap();
        cpu.regs.write(1, addr);
        let cases = [
            (0, 0xFFFF_FFFF_FFFF_FF88u64), // lb
            (4, 0x88),                     // lbu
            (1, 0xFFFF_FFFF_FFFF_9988),    // lh
            (5, 0x9988),                   // lhu
            (2, 0xFFFF_FFFF_BBAA_9988),    // lw
            (6, 0xBBAA_9988),              // lwu
            (3, 0xFFEE_DDCC_BBAA_9988),    // ld
        ];
        for (funct3, expected) in cases {
            run(&mut cpu, &mut bus, encode_i(0, 1, funct3, 3, 0x03));
            assert_eq!(cpu.regs.read(3), expected, "funct3 {}", funct3);
        }
        // sh x1, 8(x1) stores only the low half.
        run(&mut cpu, &mut bus, encode_s(8, 1, 1, 1, 0x23));
        assert_eq!(
            bus.read(addr + 8, AccessSize::Double, Rmw::None).unwrap(),
            (addr & 0xFFFF)
        );
    }

    #[test]
    fn test_x0_stays_zero() {
        let mut bus = make_space();
        let mut cpu = make_cpu();
        run(&mut cpu, &mut bus, encode_i(5, 0, 0, 0, 0x13));
        assert_eq!(cpu.regs.read(0), 0);
    }

    #[test]
    fn test_csrrs_returns_old_and_sets_bits() {
        let mut bus = make_space();
        let mut cpu = make_cpu();
        cpu.csr.update(CSR_MSCRATCH, 5, CsrOp::Write).unwrap();
        cpu.regs.write(1, 2);
        run(&mut cpu, &mut bus, encode_csr(CSR_MSCRATCH, 1, 2, 3));
        assert_eq!(cpu.regs.read(3), 5);
        assert_eq!(cpu.csr.read(CSR_MSCRATCH).unwrap(), 7);

        // csrrci x4, mscratch, 1
        run(&mut cpu, &mut bus, encode_csr(CSR_MSCRATCH, 1, 7, 4));
        assert_eq!(cpu.regs.read(4), 7);
        assert_eq!(cpu.csr.read(CSR_MSCRATCH).unwrap(), 6);
    }

    #[test]
    fn test_csr_read_only_and_illegal_tval() {
        let mut bus = make_space();
        let mut cpu = make_cpu();
        // csrrs x3, mhartid, x0 only reads.
        run(&mut cpu, &mut bus, encode_csr(CSR_MHARTID, 0, 2, 3));
        assert_eq!(cpu.pc, RAM_BASE + 4);
        // csrrw x3, mhartid, x1 writes a read-only CSR.
        let raw = encode_csr(CSR_MHARTID, 1, 1, 3);
        run(&mut cpu, &mut bus, raw);
        assert_eq!(cpu.pc, RAM_BASE + 0x8000);
        assert_eq!(cpu.csr.get(CSR_MCAUSE), 2);
        assert_eq!(cpu.csr.get(CSR_MTVAL), raw as u64);
        assert_eq!(cpu.csr.get(CSR_MEPC), RAM_BASE + 4);
    }

    #[test]
    fn test_csrrw_to_x0_still_checks_privilege() {
        let mut bus = make_space();
        let mut cpu = make_cpu();
        cpu.regs.write(1, 0x55);
        // csrrw x0, mscratch, x1
        run(&mut cpu, &mut bus, encode_csr(CSR_MSCRATCH, 1, 1, 0));
        assert_eq!(cpu.csr.get(CSR_MSCRATCH), 0x55);
        assert_eq!(cpu.regs.read(0), 0);

        let mut cpu = make_cpu();
        cpu.csr.set_mode(Mode::User);
        let raw = encode_csr(CSR_MSCRATCH, 1, 1, 0);
        run(&mut cpu, &mut bus, raw);
        assert_eq!(cpu.csr.get(CSR_MCAUSE), 2);
        assert_eq!(cpu.csr.get(CSR_MTVAL), raw as u64);
        assert_eq!(cpu.csr.get(CSR_MSCRATCH), 0);
    }

    #[test]
    fn test_ecall_cause_follows_privilege() {
        let mut bus = make_space();
        for (mode, cause) in [(Mode::User, 8), (Mode::Supervisor, 9), (Mode::Machine, 11)] {
            let mut cpu = make_cpu();
            cpu.csr.set_mode(mode);
            run(&mut cpu, &mut bus, 0x0000_0073);
            assert_eq!(cpu.csr.get(CSR_MCAUSE), cause);
            assert_eq!(cpu.csr.mode(), Mode::Machine);
            assert_eq!(cpu.csr.retired(), 0);
        }
    }

    #[test]
    fn test_xret_privilege_checks() {
        let mut bus = make_space();
        let mut cpu = make_cpu();
        cpu.csr.set_mode(Mode::Supervisor);
        run(&mut cpu, &mut bus, 0x3020_0073); // mret
        assert_eq!(cpu.csr.get(CSR_MCAUSE), 2);

        let mut cpu = make_cpu();
        cpu.csr.set_mode(Mode::Supervisor);
        cpu.csr
            .set(CSR_MSTATUS, cpu.csr.get(CSR_MSTATUS) | MSTATUS_TSR);
        run(&mut cpu, &mut bus, 0x1020_0073); // sret
        assert_eq!(cpu.csr.get(CSR_MCAUSE), 2);

        let mut cpu = make_cpu();
        run(&mut cpu, &mut bus, 0x0020_0073); // uret
        assert_eq!(cpu.csr.get(CSR_MCAUSE), 2);
    }

    #[test]
    fn test_mret_returns_to_mepc() {
        let mut bus = make_space();
        let mut cpu = make_cpu();
        cpu.csr.set(CSR_MEPC, RAM_BASE + 0x40);
        let mpp_s = Mode::Supervisor.to_mpp() << MSTATUS_MPP_SHIFT;
        cpu.csr
            .set(CSR_MSTATUS, cpu.csr.get(CSR_MSTATUS) | mpp_s | MSTATUS_MPIE);
        run(&mut cpu, &mut bus, 0x3020_0073);
        assert_eq!(cpu.pc, RAM_BASE + 0x40);
        assert_eq!(cpu.csr.mode(), Mode::Supervisor);
        assert_ne!(cpu.csr.get(CSR_MSTATUS) & MSTATUS_MIE, 0);
    }

    #[test]
    fn test_amo_results_and_reservation() {
        let mut bus = make_space();
        let mut cpu = make_cpu();
        let addr = RAM_BASE + 0x300;
        bus.write(addr, AccessSize::Word, 0xFFFF_FFFF, Rmw::None).unwrap();
        cpu.regs.write(1, addr);
        cpu.regs.write(2, 3);

        // amoadd.w x3, x2, (x1): old value sign-extended, memory wraps.
        run(&mut cpu, &mut bus, encode_amo(0x00, 2, 1, 2, 3));
        assert_eq!(cpu.regs.read(3), u64::MAX);
        assert_eq!(bus.read(addr, AccessSize::Word, Rmw::None).unwrap(), 2);

        // amomax.w picks the signed maximum.
        cpu.regs.write(2, -5i64 as u64);
        run(&mut cpu, &mut bus, encode_amo(0x14, 2, 1, 2, 3));
        assert_eq!(bus.read(addr, AccessSize::Word, Rmw::None).unwrap(), 2);
        // amominu.w treats -5 as a large unsigned value.
        run(&mut cpu, &mut bus, encode_amo(0x18, 2, 1, 2, 3));
        assert_eq!(bus.read(addr, AccessSize::Word, Rmw::None).unwrap(), 2);

        // lr.d / amoswap.d / sc.d: the AMO breaks the reservation.
        run(&mut cpu, &mut bus, encode_amo(0x02, 0, 1, 3, 4));
        run(&mut cpu, &mut bus, encode_amo(0x01, 2, 1, 3, 5));
        run(&mut cpu, &mut bus, encode_amo(0x03, 2, 1, 3, 6));
        assert_eq!(cpu.regs.read(6), 1);

        // Misaligned AMO raises a store/AMO misaligned fault.
        cpu.regs.write(1, addr + 1);
        run(&mut cpu, &mut bus, encode_amo(0x01, 2, 1, 3, 5));
        assert_eq!(cpu.csr.get(CSR_MCAUSE), 6);
        assert_eq!(cpu.csr.get(CSR_MTVAL), addr + 1);
    }

    #[test]
    fn test_fp_moves_and_nan_boxing() {
        let mut bus = make_space();
        let mut cpu = make_cpu();
        cpu.regs.write(1, 0x3F80_0000);
        // FS off: illegal.
        run(&mut cpu, &mut bus, encode_r(0x78, 0, 1, 0, 2, 0x53));
        assert_eq!(cpu.csr.get(CSR_MCAUSE), 2);

        let mut cpu = make_cpu();
        cpu.csr
            .set(CSR_MSTATUS, cpu.csr.get(CSR_MSTATUS) | (1 << 13));
        cpu.regs.write(1, 0x3F80_0000);
        // fmv.w.x f2, x1
        run(&mut cpu, &mut bus, encode_r(0x78, 0, 1, 0, 2, 0x53));
        assert_eq!(cpu.regs.read_f(2), 0xFFFF_FFFF_3F80_0000);
        assert_eq!(cpu.csr.get(CSR_MSTATUS) & MSTATUS_FS, MSTATUS_FS);
        // fmv.x.w x3, f2 sign-extends the low word.
        run(&mut cpu, &mut bus, encode_r(0x70, 0, 2, 0, 3, 0x53));
        assert_eq!(cpu.regs.read(3), 0x3F80_0000);

        // fsd f2, 0(x4) ; fld f5, 0(x4)
        cpu.regs.write(4, RAM_BASE + 0x500);
        run(&mut cpu, &mut bus, encode_s(0, 2, 4, 3, 0x27));
        run(&mut cpu, &mut bus, encode_i(0, 4, 3, 5, 0x07));
        assert_eq!(cpu.regs.read_f(5), 0xFFFF_FFFF_3F80_0000);
    }

    #[test]
    fn test_sfence_from_user_is_illegal() {
        let mut bus = make_space();
        let mut cpu = make_cpu();
        cpu.csr.set_mode(Mode::User);
        run(&mut cpu, &mut bus, 0x1200_0073);
        assert_eq!(cpu.csr.get(CSR_MCAUSE), 2);
        assert_eq!(cpu.csr.mode(), Mode::Machine);
    }
}
