use crate::address_space::{AccessSize, AddressSpace, Rmw};
use crate::csr::CsrFile;
use crate::decoder::{self, instruction_length};
use crate::error::FatalError;
use crate::execute::execute;
use crate::mmu::{self, AccessType, PAGE_SIZE};
use crate::regfile::RegisterFile;
use crate::timer::Timebase;
use crate::trace::Tracer;
use crate::trap::{self, Exception, InterruptSource};
use crate::Trap;

/// Architectural state of the single hart.
pub struct CpuState {
    pub regs: RegisterFile,
    pub csr: CsrFile,
    pub pc: u64,
    /// Address held by the last LR, cleared by traps, xRET and conflicting
    /// stores.
    pub reservation: Option<u64>,
}

/// LR/SC reservations cover one aligned 64-byte block.
const RESERVATION_GRANULE: u64 = 64;

fn reservation_granule(addr: u64) -> u64 {
    addr & !(RESERVATION_GRANULE - 1)
}

fn crosses_page(addr: u64, bytes: usize) -> bool {
    (addr & (PAGE_SIZE - 1)) + bytes as u64 > PAGE_SIZE
}

impl CpuState {
    pub fn new(pc: u64, timebase: Timebase) -> Self {
        Self {
            regs: RegisterFile::new(),
            csr: CsrFile::new(timebase),
            pc,
            reservation: None,
        }
    }

    pub fn translate(
        &self,
        bus: &mut AddressSpace,
        addr: u64,
        access: AccessType,
    ) -> Result<u64, Trap> {
        mmu::translate(bus, &self.csr, addr, access)
    }

    /// Virtual load. Accesses that straddle a page are translated and read
    /// a byte at a time.
    pub fn load(&self, bus: &mut AddressSpace, addr: u64, size: AccessSize) -> Result<u64, Trap> {
        let n = size.bytes();
        if !crosses_page(addr, n) {
            let pa = self.translate(bus, addr, AccessType::Load)?;
            return Ok(bus.read(pa, size, Rmw::None)?);
        }
        let mut value = 0u64;
        for i in 0..n {
            let pa = self.translate(bus, addr.wrapping_add(i as u64), AccessType::Load)?;
            value |= bus.read(pa, AccessSize::Byte, Rmw::None)? << (8 * i);
        }
        Ok(value)
    }

    /// Virtual store. Every byte is translated before anything is written.
    pub fn store(
        &mut self,
        bus: &mut AddressSpace,
        addr: u64,
        size: AccessSize,
        value: u64,
    ) -> Result<(), Trap> {
        let n = size.bytes();
        self.clear_reservation_if_conflict(addr);
        if !crosses_page(addr, n) {
            let pa = self.translate(bus, addr, AccessType::Store)?;
            bus.write(pa, size, value, Rmw::None)?;
            return Ok(());
        }
        let mut targets = [0u64; 8];
        for (i, target) in targets.iter_mut().take(n).enumerate() {
            *target = self.translate(bus, addr.wrapping_add(i as u64), AccessType::Store)?;
        }
        for (i, &pa) in targets.iter().take(n).enumerate() {
            bus.write(pa, AccessSize::Byte, value >> (8 * i), Rmw::None)?;
        }
        Ok(())
    }

    /// Atomic read-modify-write. The address must be naturally aligned.
    /// Returns the previous memory value, zero-extended.
    pub fn amo(
        &mut self,
        bus: &mut AddressSpace,
        addr: u64,
        size: AccessSize,
        data: u64,
        rmw: Rmw,
    ) -> Result<u64, Trap> {
        if addr % size.bytes() as u64 != 0 {
            return Err(Exception::StoreAddressMisaligned(addr).into());
        }
        self.clear_reservation_if_conflict(addr);
        let pa = self.translate(bus, addr, AccessType::Store)?;
        Ok(bus.write(pa, size, data, rmw)?)
    }

    /// LR: aligned load that leaves a reservation on `addr`.
    pub fn load_reserved(
        &mut self,
        bus: &mut AddressSpace,
        addr: u64,
        size: AccessSize,
    ) -> Result<u64, Trap> {
        if addr % size.bytes() as u64 != 0 {
            return Err(Exception::LoadAddressMisaligned(addr).into());
        }
        let pa = self.translate(bus, addr, AccessType::Load)?;
        let value = bus.read(pa, size, Rmw::LrSc)?;
        self.reservation = Some(reservation_granule(addr));
        Ok(value)
    }

    /// SC: store only while the reservation holds. Returns the value for
    /// `rd`: 0 on success, 1 on failure.
    pub fn store_conditional(
        &mut self,
        bus: &mut AddressSpace,
        addr: u64,
        size: AccessSize,
        value: u64,
    ) -> Result<u64, Trap> {
        if addr % size.bytes() as u64 != 0 {
            return Err(Exception::StoreAddressMisaligned(addr).into());
        }
        if self.reservation != Some(reservation_granule(addr)) {
            self.reservation = None;
            return Ok(1);
        }
        let pa = self.translate(bus, addr, AccessType::Store)?;
        bus.write(pa, size, value, Rmw::LrSc)?;
        self.reservation = None;
        Ok(0)
    }

    fn clear_reservation_if_conflict(&mut self, addr: u64) {
        if self.reservation == Some(reservation_granule(addr)) {
            self.reservation = None;
        }
    }

    /// Take a synchronous exception raised by the instruction at `pc` and
    /// return the handler address.
    pub fn take_exception(&mut self, pc: u64, exception: Exception) -> u64 {
        self.reservation = None;
        trap::trap_enter(&mut self.csr, pc, exception.cause(), exception.tval())
    }

    /// Fetch the instruction at `pc`. Each half-word is translated on its
    /// own so a 32-bit instruction may straddle a page.
    fn fetch(&self, bus: &mut AddressSpace, pc: u64) -> Result<u32, Trap> {
        if pc & 1 != 0 {
            return Err(Exception::InstructionAddressMisaligned(pc).into());
        }
        let pa = self.translate(bus, pc, AccessType::Instruction)?;
        let low = bus.read(pa, AccessSize::Half, Rmw::None)? as u16;
        if instruction_length(low) == 2 {
            return Ok(low as u32);
        }
        let pa_high = self.translate(bus, pc.wrapping_add(2), AccessType::Instruction)?;
        let high = bus.read(pa_high, AccessSize::Half, Rmw::None)? as u32;
        Ok((low as u32) | (high << 16))
    }

    /// One cycle: interrupt check, fetch, decode, execute.
    pub fn step(
        &mut self,
        bus: &mut AddressSpace,
        irq: &dyn InterruptSource,
        tracer: Option<&Tracer>,
    ) -> Result<(), FatalError> {
        let pc = trap::handle_interrupt(&mut self.csr, self.pc, irq);
        if pc != self.pc {
            self.reservation = None;
            self.pc = pc;
        }

        let raw = match self.fetch(bus, pc) {
            Ok(raw) => raw,
            Err(Trap::Exception(e)) => {
                self.pc = self.take_exception(pc, e);
                return Ok(());
            }
            Err(Trap::Fatal(e)) => return Err(e),
        };

        let insn = decoder::decode(raw)
            .map_err(|reason| FatalError::UnknownEncoding { pc, raw, reason })?;

        if let Some(tracer) = tracer {
            tracer.instruction(self, &insn);
        }

        self.pc = execute(self, bus, &insn)?;
        Ok(())
    }
}
