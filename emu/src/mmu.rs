use crate::address_space::{AccessSize, AddressSpace, Rmw};
use crate::csr::*;
use crate::trap::Exception;
use crate::Trap;

#[derive(Clone, Copy, PartialEq, Eq, Debug)]
pub enum AccessType {
    Instruction,
    Load,
    Store,
}

pub const PAGE_SIZE: u64 = 4096;
const PTE_SIZE: u64 = 8;
const LEVELS: usize = 3;
const VA_BITS: u64 = 39;

const SATP_MODE_SV39: u64 = 8;
const PPN_MASK: u64 = (1 << 44) - 1;

const PTE_V: u64 = 1 << 0;
const PTE_R: u64 = 1 << 1;
const PTE_W: u64 = 1 << 2;
const PTE_X: u64 = 1 << 3;
const PTE_U: u64 = 1 << 4;
const PTE_A: u64 = 1 << 6;
const PTE_D: u64 = 1 << 7;

fn page_fault(access: AccessType, addr: u64) -> Trap {
    match access {
        AccessType::Instruction => Exception::InstructionPageFault(addr),
        AccessType::Load => Exception::LoadPageFault(addr),
        AccessType::Store => Exception::StorePageFault(addr),
    }
    .into()
}

/// Privilege that loads and stores are checked against: MPRV makes M-mode
/// data accesses behave as if made from MPP.
fn effective_mode(csr: &CsrFile, access: AccessType) -> Mode {
    let mode = csr.mode();
    let mstatus = csr.get(CSR_MSTATUS);
    if mode == Mode::Machine && access != AccessType::Instruction && mstatus & MSTATUS_MPRV != 0 {
        Mode::from_mpp(mstatus >> MSTATUS_MPP_SHIFT)
    } else {
        mode
    }
}

fn permitted(mode: Mode, mstatus: u64, pte: u64, access: AccessType) -> bool {
    let user_page = pte & PTE_U != 0;
    match mode {
        Mode::User if !user_page => return false,
        Mode::Supervisor if user_page => {
            if access == AccessType::Instruction || mstatus & MSTATUS_SUM == 0 {
                return false;
            }
        }
        _ => {}
    }
    match access {
        AccessType::Instruction => pte & PTE_X != 0,
        AccessType::Store => pte & PTE_W != 0,
        AccessType::Load => pte & PTE_R != 0 || (mstatus & MSTATUS_MXR != 0 && pte & PTE_X != 0),
    }
}

/// Sv39 translation with A/D updates.
///
/// Page-table entries are read and written through the physical path of
/// `bus`. Returns the physical address, or a page fault for the access
/// type. A page-table pointer outside every device is fatal.
pub fn translate(
    bus: &mut AddressSpace,
    csr: &CsrFile,
    addr: u64,
    access: AccessType,
) -> Result<u64, Trap> {
    let mode = effective_mode(csr, access);
    let satp = csr.get(CSR_SATP);
    if mode == Mode::Machine || satp >> 60 != SATP_MODE_SV39 {
        return Ok(addr);
    }
    let mstatus = csr.get(CSR_MSTATUS);

    // Bits 63:39 must all equal bit 38.
    let upper = (addr as i64 >> (VA_BITS - 1)) as u64;
    if upper != 0 && upper != u64::MAX {
        return Err(page_fault(access, addr));
    }

    let mut table = (satp & PPN_MASK) * PAGE_SIZE;
    for level in (0..LEVELS).rev() {
        let vpn = (addr >> (12 + 9 * level as u64)) & 0x1FF;
        let pte_addr = table + vpn * PTE_SIZE;
        let pte = bus.read(pte_addr, AccessSize::Double, Rmw::None)?;

        let r = pte & PTE_R != 0;
        let w = pte & PTE_W != 0;
        let x = pte & PTE_X != 0;
        if pte & PTE_V == 0 || (!r && w) {
            return Err(page_fault(access, addr));
        }

        let ppn = (pte >> 10) & PPN_MASK;
        if !r && !x {
            if level == 0 {
                return Err(page_fault(access, addr));
            }
            table = ppn * PAGE_SIZE;
            continue;
        }

        if !permitted(mode, mstatus, pte, access) {
            return Err(page_fault(access, addr));
        }

        let vpn_mask = (1u64 << (9 * level)) - 1;
        // Superpages must be aligned to their size.
        if ppn & vpn_mask != 0 {
            return Err(page_fault(access, addr));
        }

        let mut updated = pte | PTE_A;
        if access == AccessType::Store {
            updated |= PTE_D;
        }
        if updated != pte {
            bus.write(pte_addr, AccessSize::Double, updated, Rmw::None)?;
        }

        let ppn = (ppn & !vpn_mask) | ((addr >> 12) & vpn_mask);
        return Ok((ppn << 12) | (addr & (PAGE_SIZE - 1)));
    }

    Err(page_fault(access, addr))
}
