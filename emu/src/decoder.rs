use std::fmt;
use thiserror::Error;

/// Every operation the hart executes. Compressed encodings decode to the
/// same variants as their 32-bit equivalents.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    // RV64I
    Lui,
    Auipc,
    Jal,
    Jalr,
    Beq,
    Bne,
    Blt,
    Bge,
    Bltu,
    Bgeu,
    Lb,
    Lh,
    Lw,
    Ld,
    Lbu,
    Lhu,
    Lwu,
    Sb,
    Sh,
    Sw,
    Sd,
    Addi,
    Slti,
    Sltiu,
    Xori,
    Ori,
    Andi,
    Slli,
    Srli,
    Srai,
    Add,
    Sub,
    Sll,
    Slt,
    Sltu,
    Xor,
    Srl,
    Sra,
    Or,
    And,
    Addiw,
    Slliw,
    Srliw,
    Sraiw,
    Addw,
    Subw,
    Sllw,
    Srlw,
    Sraw,
    Fence,
    FenceI,
    Ecall,
    Ebreak,

    // Privileged
    Uret,
    Sret,
    Mret,
    Wfi,
    SfenceVma,

    // Zicsr
    Csrrw,
    Csrrs,
    Csrrc,
    Csrrwi,
    Csrrsi,
    Csrrci,

    // M
    Mul,
    Mulh,
    Mulhsu,
    Mulhu,
    Div,
    Divu,
    Rem,
    Remu,
    Mulw,
    Divw,
    Divuw,
    Remw,
    Remuw,

    // A
    LrW,
    ScW,
    AmoswapW,
    AmoaddW,
    AmoxorW,
    AmoandW,
    AmoorW,
    AmominW,
    AmomaxW,
    AmominuW,
    AmomaxuW,
    LrD,
    ScD,
    AmoswapD,
    AmoaddD,
    AmoxorD,
    AmoandD,
    AmoorD,
    AmominD,
    AmomaxD,
    AmominuD,
    AmomaxuD,

    // F/D subset
    Flw,
    Fld,
    Fsw,
    Fsd,
    FmvXW,
    FmvWX,
    FmvXD,
    FmvDX,
}

impl Operation {
    pub fn mnemonic(self) -> &'static str {
        use Operation::*;
        match self {
            Lui => "lui",
            Auipc => "auipc",
            Jal => "jal",
            Jalr => "jalr",
            Beq => "beq",
            Bne => "bne",
            Blt => "blt",
            Bge => "bge",
            Bltu => "bltu",
            Bgeu => "bgeu",
            Lb => "lb",
            Lh => "lh",
            Lw => "lw",
            Ld => "ld",
            Lbu => "lbu",
            Lhu => "lhu",
            Lwu => "lwu",
            Sb => "sb",
            Sh => "sh",
            Sw => "sw",
            Sd => "sd",
            Addi => "addi",
            Slti => "slti",
            Sltiu => "sltiu",
            Xori => "xori",
            Ori => "ori",
            Andi => "andi",
            Slli => "slli",
            Srli => "srli",
            Srai => "srai",
            Add => "add",
            Sub => "sub",
            Sll => "sll",
            Slt => "slt",
            Sltu => "sltu",
            Xor => "xor",
            Srl => "srl",
            Sra => "sra",
            Or => "or",
            And => "and",
            Addiw => "addiw",
            Slliw => "slliw",
            Srliw => "srliw",
            Sraiw => "sraiw",
            Addw => "addw",
            Subw => "subw",
            Sllw => "sllw",
            Srlw => "srlw",
            Sraw => "sraw",
            Fence => "fence",
            FenceI => "fence.i",
            Ecall => "ecall",
            Ebreak => "ebreak",
            Uret => "uret",
            Sret => "sret",
            Mret => "mret",
            Wfi => "wfi",
            SfenceVma => "sfence.vma",
            Csrrw => "csrrw",
            Csrrs => "csrrs",
            Csrrc => "csrrc",
            Csrrwi => "csrrwi",
            Csrrsi => "csrrsi",
            Csrrci => "csrrci",
            Mul => "mul",
            Mulh => "mulh",
            Mulhsu => "mulhsu",
            Mulhu => "mulhu",
            Div => "div",
            Divu => "divu",
            Rem => "rem",
            Remu => "remu",
            Mulw => "mulw",
            Divw => "divw",
            Divuw => "divuw",
            Remw => "remw",
            Remuw => "remuw",
            LrW => "lr.w",
            ScW => "sc.w",
            AmoswapW => "amoswap.w",
            AmoaddW => "amoadd.w",
            AmoxorW => "amoxor.w",
            AmoandW => "amoand.w",
            AmoorW => "amoor.w",
            AmominW => "amomin.w",
            AmomaxW => "amomax.w",
            AmominuW => "amominu.w",
            AmomaxuW => "amomaxu.w",
            LrD => "lr.d",
            ScD => "sc.d",
            AmoswapD => "amoswap.d",
            AmoaddD => "amoadd.d",
            AmoxorD => "amoxor.d",
            AmoandD => "amoand.d",
            AmoorD => "amoor.d",
            AmominD => "amomin.d",
            AmomaxD => "amomax.d",
            AmominuD => "amominu.d",
            AmomaxuD => "amomaxu.d",
            Flw => "flw",
            Fld => "fld",
            Fsw => "fsw",
            Fsd => "fsd",
            FmvXW => "fmv.x.w",
            FmvWX => "fmv.w.x",
            FmvXD => "fmv.x.d",
            FmvDX => "fmv.d.x",
        }
    }

    pub fn is_csr(self) -> bool {
        matches!(
            self,
            Operation::Csrrw
                | Operation::Csrrs
                | Operation::Csrrc
                | Operation::Csrrwi
                | Operation::Csrrsi
                | Operation::Csrrci
        )
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.pad(self.mnemonic())
    }
}

/// Why a word could not be decoded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum DecodeError {
    #[error("unknown opcode {0:#04x}")]
    UnknownOpcode(u32),

    #[error("unknown {field} {value:#x} for opcode {opcode:#04x}")]
    UnknownFunct {
        opcode: u32,
        field: &'static str,
        value: u32,
    },

    #[error("reserved compressed encoding (quadrant {quadrant}, funct3 {funct3})")]
    ReservedCompressed { quadrant: u32, funct3: u32 },
}

/// A normalized instruction.
///
/// Register fields a format does not use are zero. `imm` is already sign-
/// or zero-extended as the operation requires; for shifts it holds the
/// shift amount and for `CSR*I` the 5-bit zero-extended immediate.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecodedInstruction {
    pub op: Operation,
    pub rd: u8,
    pub rs1: u8,
    pub rs2: u8,
    pub imm: u64,
    pub csr: u16,
    /// Encoded length in bytes: 2 or 4.
    pub len: u8,
    pub raw: u32,
}

impl DecodedInstruction {
    fn new(op: Operation, raw: u32, len: u8) -> Self {
        Self {
            op,
            rd: 0,
            rs1: 0,
            rs2: 0,
            imm: 0,
            csr: 0,
            len,
            raw,
        }
    }

    fn rd(mut self, rd: u32) -> Self {
        self.rd = rd as u8;
        self
    }

    fn rs1(mut self, rs1: u32) -> Self {
        self.rs1 = rs1 as u8;
        self
    }

    fn rs2(mut self, rs2: u32) -> Self {
        self.rs2 = rs2 as u8;
        self
    }

    fn imm(mut self, imm: u64) -> Self {
        self.imm = imm;
        self
    }
}

/// Length of the instruction whose low half-word is `low`.
pub fn instruction_length(low: u16) -> u8 {
    if low & 0b11 == 0b11 {
        4
    } else {
        2
    }
}

/// Decode a 16- or 32-bit instruction word. For a compressed instruction
/// only the low 16 bits are looked at.
pub fn decode(raw: u32) -> Result<DecodedInstruction, DecodeError> {
    if raw & 0b11 == 0b11 {
        decode32(raw)
    } else {
        decode16(raw as u16)
    }
}

#[inline]
fn bits(v: u32, hi: u32, lo: u32) -> u32 {
    (v >> lo) & ((1u32 << (hi - lo + 1)) - 1)
}

#[inline]
fn bit(v: u32, i: u32) -> u32 {
    (v >> i) & 1
}

/// Sign-extend the low `width` bits of `value`.
#[inline]
fn sext(value: u32, width: u32) -> u64 {
    let shift = 64 - width;
    (((value as u64) << shift) as i64 >> shift) as u64
}

fn imm_i(raw: u32) -> u64 {
    sext(bits(raw, 31, 20), 12)
}

fn imm_s(raw: u32) -> u64 {
    sext((bits(raw, 31, 25) << 5) | bits(raw, 11, 7), 12)
}

fn imm_b(raw: u32) -> u64 {
    sext(
        (bit(raw, 31) << 12) | (bit(raw, 7) << 11) | (bits(raw, 30, 25) << 5) | (bits(raw, 11, 8) << 1),
        13,
    )
}

fn imm_u(raw: u32) -> u64 {
    sext(raw & 0xFFFF_F000, 32)
}

fn imm_j(raw: u32) -> u64 {
    sext(
        (bit(raw, 31) << 20)
            | (bits(raw, 19, 12) << 12)
            | (bit(raw, 20) << 11)
            | (bits(raw, 30, 21) << 1),
        21,
    )
}

const OPCODE_LOAD: u32 = 0x03;
const OPCODE_LOAD_FP: u32 = 0x07;
const OPCODE_MISC_MEM: u32 = 0x0F;
const OPCODE_OP_IMM: u32 = 0x13;
const OPCODE_AUIPC: u32 = 0x17;
const OPCODE_OP_IMM_32: u32 = 0x1B;
const OPCODE_STORE: u32 = 0x23;
const OPCODE_STORE_FP: u32 = 0x27;
const OPCODE_AMO: u32 = 0x2F;
const OPCODE_OP: u32 = 0x33;
const OPCODE_LUI: u32 = 0x37;
const OPCODE_OP_32: u32 = 0x3B;
const OPCODE_OP_FP: u32 = 0x53;
const OPCODE_BRANCH: u32 = 0x63;
const OPCODE_JALR: u32 = 0x67;
const OPCODE_JAL: u32 = 0x6F;
const OPCODE_SYSTEM: u32 = 0x73;

pub fn decode32(raw: u32) -> Result<DecodedInstruction, DecodeError> {
    use Operation::*;

    let opcode = bits(raw, 6, 0);
    let rd = bits(raw, 11, 7);
    let rs1 = bits(raw, 19, 15);
    let rs2 = bits(raw, 24, 20);
    let funct3 = bits(raw, 14, 12);
    let funct7 = bits(raw, 31, 25);

    let unknown = |field: &'static str, value: u32| DecodeError::UnknownFunct {
        opcode,
        field,
        value,
    };
    let i_type = |op| DecodedInstruction::new(op, raw, 4).rd(rd).rs1(rs1).imm(imm_i(raw));
    let s_type = |op| DecodedInstruction::new(op, raw, 4).rs1(rs1).rs2(rs2).imm(imm_s(raw));
    let r_type = |op| DecodedInstruction::new(op, raw, 4).rd(rd).rs1(rs1).rs2(rs2);

    let insn = match opcode {
        OPCODE_LUI => DecodedInstruction::new(Lui, raw, 4).rd(rd).imm(imm_u(raw)),
        OPCODE_AUIPC => DecodedInstruction::new(Auipc, raw, 4).rd(rd).imm(imm_u(raw)),
        OPCODE_JAL => DecodedInstruction::new(Jal, raw, 4).rd(rd).imm(imm_j(raw)),
        OPCODE_JALR => match funct3 {
            0 => i_type(Jalr),
            _ => return Err(unknown("funct3", funct3)),
        },
        OPCODE_BRANCH => {
            let op = match funct3 {
                0 => Beq,
                1 => Bne,
                4 => Blt,
                5 => Bge,
                6 => Bltu,
                7 => Bgeu,
                _ => return Err(unknown("funct3", funct3)),
            };
            DecodedInstruction::new(op, raw, 4)
                .rs1(rs1)
                .rs2(rs2)
                .imm(imm_b(raw))
        }
        OPCODE_LOAD => i_type(match funct3 {
            0 => Lb,
            1 => Lh,
            2 => Lw,
            3 => Ld,
            4 => Lbu,
            5 => Lhu,
            6 => Lwu,
            _ => return Err(unknown("funct3", funct3)),
        }),
        OPCODE_STORE => s_type(match funct3 {
            0 => Sb,
            1 => Sh,
            2 => Sw,
            3 => Sd,
            _ => return Err(unknown("funct3", funct3)),
        }),
        OPCODE_OP_IMM => {
            // RV64 shifts take a 6-bit shamt; funct6 selects logical/arithmetic.
            let funct6 = bits(raw, 31, 26);
            let shamt = bits(raw, 25, 20) as u64;
            match funct3 {
                0 => i_type(Addi),
                2 => i_type(Slti),
                3 => i_type(Sltiu),
                4 => i_type(Xori),
                6 => i_type(Ori),
                7 => i_type(Andi),
                1 if funct6 == 0 => i_type(Slli).imm(shamt),
                5 if funct6 == 0 => i_type(Srli).imm(shamt),
                5 if funct6 == 0x10 => i_type(Srai).imm(shamt),
                _ => return Err(unknown("funct6", funct6)),
            }
        }
        OPCODE_OP_IMM_32 => {
            let shamt = bits(raw, 24, 20) as u64;
            match (funct3, funct7) {
                (0, _) => i_type(Addiw),
                (1, 0x00) => i_type(Slliw).imm(shamt),
                (5, 0x00) => i_type(Srliw).imm(shamt),
                (5, 0x20) => i_type(Sraiw).imm(shamt),
                _ => return Err(unknown("funct7", funct7)),
            }
        }
        OPCODE_OP => r_type(match (funct7, funct3) {
            (0x00, 0) => Add,
            (0x20, 0) => Sub,
            (0x00, 1) => Sll,
            (0x00, 2) => Slt,
            (0x00, 3) => Sltu,
            (0x00, 4) => Xor,
            (0x00, 5) => Srl,
            (0x20, 5) => Sra,
            (0x00, 6) => Or,
            (0x00, 7) => And,
            (0x01, 0) => Mul,
            (0x01, 1) => Mulh,
            (0x01, 2) => Mulhsu,
            (0x01, 3) => Mulhu,
            (0x01, 4) => Div,
            (0x01, 5) => Divu,
            (0x01, 6) => Rem,
            (0x01, 7) => Remu,
            _ => return Err(unknown("funct7", funct7)),
        }),
        OPCODE_OP_32 => r_type(match (funct7, funct3) {
            (0x00, 0) => Addw,
            (0x20, 0) => Subw,
            (0x00, 1) => Sllw,
            (0x00, 5) => Srlw,
            (0x20, 5) => Sraw,
            (0x01, 0) => Mulw,
            (0x01, 4) => Divw,
            (0x01, 5) => Divuw,
            (0x01, 6) => Remw,
            (0x01, 7) => Remuw,
            _ => return Err(unknown("funct7", funct7)),
        }),
        OPCODE_MISC_MEM => match funct3 {
            // pred/succ/fm are kept in the immediate; nothing consumes them.
            0 => i_type(Fence),
            1 => i_type(FenceI),
            _ => return Err(unknown("funct3", funct3)),
        },
        OPCODE_SYSTEM => decode_system(raw, rd, rs1, rs2, funct3, funct7)?,
        OPCODE_AMO => {
            let funct5 = bits(raw, 31, 27);
            let word = match funct3 {
                2 => true,
                3 => false,
                _ => return Err(unknown("funct3", funct3)),
            };
            let op = match (funct5, word) {
                (0x02, true) if rs2 == 0 => LrW,
                (0x03, true) => ScW,
                (0x01, true) => AmoswapW,
                (0x00, true) => AmoaddW,
                (0x04, true) => AmoxorW,
                (0x0C, true) => AmoandW,
                (0x08, true) => AmoorW,
                (0x10, true) => AmominW,
                (0x14, true) => AmomaxW,
                (0x18, true) => AmominuW,
                (0x1C, true) => AmomaxuW,
                (0x02, false) if rs2 == 0 => LrD,
                (0x03, false) => ScD,
                (0x01, false) => AmoswapD,
                (0x00, false) => AmoaddD,
                (0x04, false) => AmoxorD,
                (0x0C, false) => AmoandD,
                (0x08, false) => AmoorD,
                (0x10, false) => AmominD,
                (0x14, false) => AmomaxD,
                (0x18, false) => AmominuD,
                (0x1C, false) => AmomaxuD,
                _ => return Err(unknown("funct5", funct5)),
            };
            r_type(op)
        }
        OPCODE_LOAD_FP => i_type(match funct3 {
            2 => Flw,
            3 => Fld,
            _ => return Err(unknown("funct3", funct3)),
        }),
        OPCODE_STORE_FP => s_type(match funct3 {
            2 => Fsw,
            3 => Fsd,
            _ => return Err(unknown("funct3", funct3)),
        }),
        OPCODE_OP_FP => {
            if rs2 != 0 || funct3 != 0 {
                return Err(unknown("funct7", funct7));
            }
            let op = match funct7 {
                0x70 => FmvXW,
                0x78 => FmvWX,
                0x71 => FmvXD,
                0x79 => FmvDX,
                _ => return Err(unknown("funct7", funct7)),
            };
            DecodedInstruction::new(op, raw, 4).rd(rd).rs1(rs1)
        }
        _ => return Err(DecodeError::UnknownOpcode(opcode)),
    };
    Ok(insn)
}

fn decode_system(
    raw: u32,
    rd: u32,
    rs1: u32,
    rs2: u32,
    funct3: u32,
    funct7: u32,
) -> Result<DecodedInstruction, DecodeError> {
    use Operation::*;

    let csr = bits(raw, 31, 20) as u16;
    let csr_type = |op| {
        let mut insn = DecodedInstruction::new(op, raw, 4).rd(rd).rs1(rs1);
        insn.csr = csr;
        insn
    };
    let csr_imm = |op| {
        let mut insn = DecodedInstruction::new(op, raw, 4).rd(rd).imm(rs1 as u64);
        insn.csr = csr;
        insn
    };

    let insn = match funct3 {
        0 => {
            if rd != 0 {
                return Err(DecodeError::UnknownFunct {
                    opcode: OPCODE_SYSTEM,
                    field: "rd",
                    value: rd,
                });
            }
            match (funct7, rs2, rs1) {
                (0x00, 0, 0) => DecodedInstruction::new(Ecall, raw, 4),
                (0x00, 1, 0) => DecodedInstruction::new(Ebreak, raw, 4),
                (0x00, 2, 0) => DecodedInstruction::new(Uret, raw, 4),
                (0x08, 2, 0) => DecodedInstruction::new(Sret, raw, 4),
                (0x08, 5, 0) => DecodedInstruction::new(Wfi, raw, 4),
                (0x18, 2, 0) => DecodedInstruction::new(Mret, raw, 4),
                (0x09, _, _) => DecodedInstruction::new(SfenceVma, raw, 4).rs1(rs1).rs2(rs2),
                _ => {
                    return Err(DecodeError::UnknownFunct {
                        opcode: OPCODE_SYSTEM,
                        field: "funct7",
                        value: funct7,
                    })
                }
            }
        }
        1 => csr_type(Csrrw),
        2 => csr_type(Csrrs),
        3 => csr_type(Csrrc),
        5 => csr_imm(Csrrwi),
        6 => csr_imm(Csrrsi),
        7 => csr_imm(Csrrci),
        _ => {
            return Err(DecodeError::UnknownFunct {
                opcode: OPCODE_SYSTEM,
                field: "funct3",
                value: funct3,
            })
        }
    };
    Ok(insn)
}

/// Compressed register field: x8..x15.
#[inline]
fn creg(field: u32) -> u32 {
    field + 8
}

pub fn decode16(half: u16) -> Result<DecodedInstruction, DecodeError> {
    let raw = half as u32;
    let quadrant = raw & 0b11;
    let funct3 = bits(raw, 15, 13);
    let reserved = DecodeError::ReservedCompressed { quadrant, funct3 };
    let insn = match quadrant {
        0 => decode_q0(raw, funct3),
        1 => decode_q1(raw, funct3),
        2 => decode_q2(raw, funct3),
        _ => None,
    };
    insn.ok_or(reserved)
}

fn decode_q0(raw: u32, funct3: u32) -> Option<DecodedInstruction> {
    use Operation::*;

    let c = |op| DecodedInstruction::new(op, raw, 2);
    let rd_p = creg(bits(raw, 4, 2));
    let rs1_p = creg(bits(raw, 9, 7));
    // uimm[5:3|7:6] for the doubleword forms, uimm[5:3|2|6] for word forms.
    let uimm_d = ((bits(raw, 12, 10) << 3) | (bits(raw, 6, 5) << 6)) as u64;
    let uimm_w = ((bits(raw, 12, 10) << 3) | (bit(raw, 6) << 2) | (bit(raw, 5) << 6)) as u64;

    let insn = match funct3 {
        // c.addi4spn: nzuimm[5:4|9:6|2|3]
        0 => {
            let nzuimm = (bits(raw, 12, 11) << 4)
                | (bits(raw, 10, 7) << 6)
                | (bit(raw, 6) << 2)
                | (bit(raw, 5) << 3);
            if nzuimm == 0 {
                return None;
            }
            c(Addi).rd(rd_p).rs1(2).imm(nzuimm as u64)
        }
        1 => c(Fld).rd(rd_p).rs1(rs1_p).imm(uimm_d),
        2 => c(Lw).rd(rd_p).rs1(rs1_p).imm(uimm_w),
        3 => c(Ld).rd(rd_p).rs1(rs1_p).imm(uimm_d),
        5 => c(Fsd).rs1(rs1_p).rs2(rd_p).imm(uimm_d),
        6 => c(Sw).rs1(rs1_p).rs2(rd_p).imm(uimm_w),
        7 => c(Sd).rs1(rs1_p).rs2(rd_p).imm(uimm_d),
        _ => return None,
    };
    Some(insn)
}

fn decode_q1(raw: u32, funct3: u32) -> Option<DecodedInstruction> {
    use Operation::*;

    let c = |op| DecodedInstruction::new(op, raw, 2);
    let rd = bits(raw, 11, 7);
    let rd_p = creg(bits(raw, 9, 7));
    let rs2_p = creg(bits(raw, 4, 2));
    let imm6 = sext((bit(raw, 12) << 5) | bits(raw, 6, 2), 6);

    let insn = match funct3 {
        // c.nop is c.addi x0, 0
        0 => c(Addi).rd(rd).rs1(rd).imm(imm6),
        1 => {
            if rd == 0 {
                return None;
            }
            c(Addiw).rd(rd).rs1(rd).imm(imm6)
        }
        2 => c(Addi).rd(rd).rs1(0).imm(imm6),
        3 => {
            if rd == 2 {
                // c.addi16sp: nzimm[9|4|6|8:7|5]
                let nzimm = (bit(raw, 12) << 9)
                    | (bit(raw, 6) << 4)
                    | (bit(raw, 5) << 6)
                    | (bits(raw, 4, 3) << 7)
                    | (bit(raw, 2) << 5);
                if nzimm == 0 {
                    return None;
                }
                c(Addi).rd(2).rs1(2).imm(sext(nzimm, 10))
            } else {
                // c.lui: nzimm[17|16:12]
                let nzimm = (bit(raw, 12) << 17) | (bits(raw, 6, 2) << 12);
                if nzimm == 0 {
                    return None;
                }
                c(Lui).rd(rd).imm(sext(nzimm, 18))
            }
        }
        4 => {
            let shamt = ((bit(raw, 12) << 5) | bits(raw, 6, 2)) as u64;
            match bits(raw, 11, 10) {
                0 => c(Srli).rd(rd_p).rs1(rd_p).imm(shamt),
                1 => c(Srai).rd(rd_p).rs1(rd_p).imm(shamt),
                2 => c(Andi).rd(rd_p).rs1(rd_p).imm(imm6),
                _ => {
                    let op = match (bit(raw, 12), bits(raw, 6, 5)) {
                        (0, 0) => Sub,
                        (0, 1) => Xor,
                        (0, 2) => Or,
                        (0, 3) => And,
                        (1, 0) => Subw,
                        (1, 1) => Addw,
                        _ => return None,
                    };
                    c(op).rd(rd_p).rs1(rd_p).rs2(rs2_p)
                }
            }
        }
        // c.j: offset[11|4|9:8|10|6|7|3:1|5]
        5 => {
            let offset = (bit(raw, 12) << 11)
                | (bit(raw, 11) << 4)
                | (bits(raw, 10, 9) << 8)
                | (bit(raw, 8) << 10)
                | (bit(raw, 7) << 6)
                | (bit(raw, 6) << 7)
                | (bits(raw, 5, 3) << 1)
                | (bit(raw, 2) << 5);
            c(Jal).rd(0).imm(sext(offset, 12))
        }
        // c.beqz / c.bnez: offset[8|4:3] [7:6|2:1|5]
        6 | 7 => {
            let offset = (bit(raw, 12) << 8)
                | (bits(raw, 11, 10) << 3)
                | (bits(raw, 6, 5) << 6)
                | (bits(raw, 4, 3) << 1)
                | (bit(raw, 2) << 5);
            let op = if funct3 == 6 { Beq } else { Bne };
            c(op).rs1(rd_p).rs2(0).imm(sext(offset, 9))
        }
        _ => return None,
    };
    Some(insn)
}

fn decode_q2(raw: u32, funct3: u32) -> Option<DecodedInstruction> {
    use Operation::*;

    let c = |op| DecodedInstruction::new(op, raw, 2);
    let rd = bits(raw, 11, 7);
    let rs2 = bits(raw, 6, 2);
    // uimm[5|4:3|8:6] for ldsp/fldsp, uimm[5|4:2|7:6] for lwsp.
    let uimm_ldsp = ((bit(raw, 12) << 5) | (bits(raw, 6, 5) << 3) | (bits(raw, 4, 2) << 6)) as u64;
    let uimm_lwsp = ((bit(raw, 12) << 5) | (bits(raw, 6, 4) << 2) | (bits(raw, 3, 2) << 6)) as u64;
    // uimm[5:3|8:6] for sdsp/fsdsp, uimm[5:2|7:6] for swsp.
    let uimm_sdsp = ((bits(raw, 12, 10) << 3) | (bits(raw, 9, 7) << 6)) as u64;
    let uimm_swsp = ((bits(raw, 12, 9) << 2) | (bits(raw, 8, 7) << 6)) as u64;

    let insn = match funct3 {
        0 => {
            let shamt = ((bit(raw, 12) << 5) | bits(raw, 6, 2)) as u64;
            c(Slli).rd(rd).rs1(rd).imm(shamt)
        }
        1 => c(Fld).rd(rd).rs1(2).imm(uimm_ldsp),
        2 => {
            if rd == 0 {
                return None;
            }
            c(Lw).rd(rd).rs1(2).imm(uimm_lwsp)
        }
        3 => {
            if rd == 0 {
                return None;
            }
            c(Ld).rd(rd).rs1(2).imm(uimm_ldsp)
        }
        4 => match (bit(raw, 12), rd, rs2) {
            (0, 0, 0) => return None,
            // c.jr
            (0, rs1, 0) => c(Jalr).rd(0).rs1(rs1),
            // c.mv
            (0, _, _) => c(Add).rd(rd).rs1(0).rs2(rs2),
            (1, 0, 0) => c(Ebreak),
            // c.jalr
            (1, rs1, 0) => c(Jalr).rd(1).rs1(rs1),
            // c.add
            _ => c(Add).rd(rd).rs1(rd).rs2(rs2),
        },
        5 => c(Fsd).rs1(2).rs2(rs2).imm(uimm_sdsp),
        6 => c(Sw).rs1(2).rs2(rs2).imm(uimm_swsp),
        7 => c(Sd).rs1(2).rs2(rs2).imm(uimm_sdsp),
        _ => return None,
    };
    Some(insn)
}
