use crate::address_space::AddressSpace;
use crate::cpu::CpuState;
use crate::csr::{csr_name, CSR_MCAUSE, CSR_MEPC, CSR_MSTATUS, CSR_MTVAL, CSR_SATP, CSR_SCAUSE, CSR_SEPC};
use crate::decoder::DecodedInstruction;
use crate::error::FatalError;
use crate::loader::SymbolTable;
use crate::regfile::abi_name;
use std::fmt::Write;

/// Inclusive pc range for which instructions are traced.
#[derive(Debug, Clone, Copy)]
pub struct TraceWindow {
    pub from: u64,
    pub to: u64,
}

impl TraceWindow {
    pub fn new(from: Option<u64>, to: Option<u64>) -> Self {
        Self {
            from: from.unwrap_or(0),
            to: to.unwrap_or(u64::MAX),
        }
    }

    pub fn contains(&self, pc: u64) -> bool {
        (self.from..=self.to).contains(&pc)
    }
}

impl Default for TraceWindow {
    fn default() -> Self {
        Self::new(None, None)
    }
}

/// Per-instruction trace at `trace` level.
#[derive(Default)]
pub struct Tracer {
    window: TraceWindow,
    symbols: SymbolTable,
}

impl Tracer {
    pub fn new(window: TraceWindow, symbols: SymbolTable) -> Self {
        Self { window, symbols }
    }

    pub fn set_symbols(&mut self, symbols: SymbolTable) {
        self.symbols = symbols;
    }

    /// Log `insn` as it is about to execute. Register values are the
    /// operands, not the results.
    pub fn instruction(&self, cpu: &CpuState, insn: &DecodedInstruction) {
        if !log::log_enabled!(log::Level::Trace) || !self.window.contains(cpu.pc) {
            return;
        }
        log::trace!("{}", self.format(cpu, insn));
    }

    fn format(&self, cpu: &CpuState, insn: &DecodedInstruction) -> String {
        let mut line = format!("{:016x} {:?} {:<10}", cpu.pc, cpu.csr.mode(), insn.op);
        let regs = [("rd", insn.rd), ("rs1", insn.rs1), ("rs2", insn.rs2)];
        for (field, index) in regs {
            if index != 0 {
                let _ = write!(
                    line,
                    " {}={}({:#x})",
                    field,
                    abi_name(index),
                    cpu.regs.read(index)
                );
            }
        }
        if insn.imm != 0 {
            let _ = write!(line, " imm={:#x}", insn.imm);
        }
        if insn.op.is_csr() {
            let _ = write!(line, " csr={}", csr_name(insn.csr));
        }
        if let Some((name, offset)) = self.symbols.lookup(cpu.pc) {
            let _ = write!(line, " <{}+{:#x}>", name, offset);
        }
        line
    }
}

/// Register file and the trap-related CSRs, one register per line.
pub fn dump_registers(cpu: &CpuState) -> String {
    let mut out = format!("pc  = {:#018x}  mode = {:?}\n", cpu.pc, cpu.csr.mode());
    for (i, value) in cpu.regs.integer().iter().enumerate() {
        let _ = write!(out, "{:>4} = {:#018x}", abi_name(i as u8), value);
        out.push(if i % 4 == 3 { '\n' } else { ' ' });
    }
    for csr in [
        CSR_MSTATUS,
        CSR_MEPC,
        CSR_MCAUSE,
        CSR_MTVAL,
        CSR_SEPC,
        CSR_SCAUSE,
        CSR_SATP,
    ] {
        let _ = writeln!(out, "{:>8} = {:#018x}", csr_name(csr), cpu.csr.get(csr));
    }
    out
}

/// Hex dump of `len` bytes of physical memory, 16 bytes per line.
pub fn hexdump(bus: &mut AddressSpace, addr: u64, len: usize) -> Result<String, FatalError> {
    let mut buf = vec![0u8; len];
    bus.read_blob(addr, &mut buf)?;
    let mut out = String::new();
    for (i, chunk) in buf.chunks(16).enumerate() {
        let _ = write!(out, "{:016x}:", addr + (i * 16) as u64);
        for byte in chunk {
            let _ = write!(out, " {:02x}", byte);
        }
        for _ in chunk.len()..16 {
            out.push_str("   ");
        }
        out.push_str("  |");
        for &byte in chunk {
            out.push(if byte.is_ascii_graphic() || byte == b' ' {
                byte as char
            } else {
                '.'
            });
        }
        out.push_str("|\n");
    }
    Ok(out)
}
