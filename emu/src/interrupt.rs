use crate::address_space::{AccessSize, Device, Rmw};
use crate::error::FatalError;
use crate::snapshot::PlicSnapshot;
use std::sync::{Arc, Mutex, MutexGuard};

pub const PLIC_BASE: u64 = 0x0C00_0000;
pub const PLIC_SIZE: u64 = 0x400_0000;

pub const UART_IRQ: u32 = 10;

const NUM_SOURCES: usize = 32;
const NUM_CONTEXTS: usize = 2;

const PRIORITY_END: u64 = 0x00_1000;
const PENDING: u64 = 0x00_1000;
const ENABLE_BASE: u64 = 0x00_2000;
const ENABLE_STRIDE: u64 = 0x80;
const CONTEXT_BASE: u64 = 0x20_0000;
const CONTEXT_STRIDE: u64 = 0x1000;

/// Hart interrupt targets of the aggregator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Context {
    Machine = 0,
    Supervisor = 1,
}

impl Context {
    fn index(self) -> usize {
        self as usize
    }

    fn from_index(index: usize) -> Option<Self> {
        match index {
            0 => Some(Context::Machine),
            1 => Some(Context::Supervisor),
            _ => None,
        }
    }
}

struct PlicState {
    priority: [u32; NUM_SOURCES],
    /// Level of each device line, one bit per source.
    pending: u32,
    enable: [u32; NUM_CONTEXTS],
    threshold: [u32; NUM_CONTEXTS],
    /// Claimed but not yet completed.
    active: [u32; NUM_CONTEXTS],
}

impl PlicState {
    fn eligible(&self, source: usize, ctx: usize) -> bool {
        let bit = 1u32 << source;
        self.pending & bit != 0
            && self.enable[ctx] & bit != 0
            && self.active[ctx] & bit == 0
            && self.priority[source] > self.threshold[ctx]
    }

    fn best(&self, ctx: usize) -> u32 {
        let mut best_prio = 0;
        let mut best_id = 0;
        for source in 1..NUM_SOURCES {
            if self.eligible(source, ctx) && self.priority[source] > best_prio {
                best_prio = self.priority[source];
                best_id = source as u32;
            }
        }
        best_id
    }
}

/// Platform-level interrupt aggregator.
///
/// Cloning yields another handle to the same state, so device threads and
/// the emulation loop can share one instance. Every operation takes the
/// single internal lock for a few bit operations.
#[derive(Clone)]
pub struct InterruptAggregator {
    state: Arc<Mutex<PlicState>>,
}

impl InterruptAggregator {
    pub fn new() -> Self {
        Self {
            state: Arc::new(Mutex::new(PlicState {
                priority: [0; NUM_SOURCES],
                pending: 0,
                enable: [0; NUM_CONTEXTS],
                threshold: [0; NUM_CONTEXTS],
                active: [0; NUM_CONTEXTS],
            })),
        }
    }

    fn lock(&self) -> MutexGuard<'_, PlicState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Raise the line of source `id`. Source 0 does not exist.
    pub fn signal(&self, id: u32) {
        if id == 0 || id as usize >= NUM_SOURCES {
            return;
        }
        let mut state = self.lock();
        if state.pending & (1 << id) == 0 {
            log::trace!("plic: source {} raised", id);
        }
        state.pending |= 1 << id;
    }

    pub fn lower(&self, id: u32) {
        if id == 0 || id as usize >= NUM_SOURCES {
            return;
        }
        self.lock().pending &= !(1 << id);
    }

    /// Whether any source is eligible to interrupt `context`.
    pub fn poll_external(&self, context: Context) -> bool {
        let state = self.lock();
        (1..NUM_SOURCES).any(|source| state.eligible(source, context.index()))
    }

    /// Claim the highest-priority eligible source for `context`, or 0.
    pub fn claim(&self, context: Context) -> u32 {
        let mut state = self.lock();
        let ctx = context.index();
        let id = state.best(ctx);
        if id != 0 {
            state.active[ctx] |= 1 << id;
        }
        log::debug!("plic: claim {:?} -> {}", context, id);
        id
    }

    pub fn complete(&self, context: Context, id: u32) {
        if id == 0 || id as usize >= NUM_SOURCES {
            return;
        }
        self.lock().active[context.index()] &= !(1 << id);
        log::debug!("plic: complete {:?} {}", context, id);
    }

    pub fn set_priority(&self, id: u32, priority: u32) {
        if (id as usize) < NUM_SOURCES {
            self.lock().priority[id as usize] = priority;
        }
    }

    pub fn set_enable(&self, context: Context, mask: u32) {
        self.lock().enable[context.index()] = mask;
    }

    pub fn set_threshold(&self, context: Context, threshold: u32) {
        self.lock().threshold[context.index()] = threshold;
    }

    pub fn export(&self) -> PlicSnapshot {
        let state = self.lock();
        PlicSnapshot {
            priority: state.priority.to_vec(),
            pending: state.pending,
            enable: state.enable.to_vec(),
            threshold: state.threshold.to_vec(),
            active: state.active.to_vec(),
        }
    }

    /// Restore from a snapshot. Missing entries become zero.
    pub fn import(&self, snap: &PlicSnapshot) {
        fn fill(dst: &mut [u32], src: &[u32]) {
            for (i, d) in dst.iter_mut().enumerate() {
                *d = src.get(i).copied().unwrap_or(0);
            }
        }
        let mut state = self.lock();
        fill(&mut state.priority, &snap.priority);
        fill(&mut state.enable, &snap.enable);
        fill(&mut state.threshold, &snap.threshold);
        fill(&mut state.active, &snap.active);
        state.pending = snap.pending;
    }

    /// Which context the register at `offset` belongs to, and the offset
    /// inside that context's block.
    fn context_at(offset: u64, base: u64, stride: u64) -> Option<(Context, u64)> {
        let rel = offset.checked_sub(base)?;
        let ctx = Context::from_index((rel / stride) as usize)?;
        Some((ctx, rel % stride))
    }
}

impl Default for InterruptAggregator {
    fn default() -> Self {
        Self::new()
    }
}

impl Device for InterruptAggregator {
    fn read(&mut self, addr: u64, size: AccessSize, _rmw: Rmw) -> Result<u64, FatalError> {
        if size != AccessSize::Word {
            return Ok(0);
        }
        if addr < PRIORITY_END {
            let idx = (addr >> 2) as usize;
            return Ok(self.lock().priority.get(idx).copied().unwrap_or(0) as u64);
        }
        if addr == PENDING {
            return Ok(self.lock().pending as u64);
        }
        if addr < CONTEXT_BASE {
            return Ok(match Self::context_at(addr, ENABLE_BASE, ENABLE_STRIDE) {
                Some((ctx, 0)) => self.lock().enable[ctx.index()] as u64,
                _ => 0,
            });
        }
        Ok(match Self::context_at(addr, CONTEXT_BASE, CONTEXT_STRIDE) {
            Some((ctx, 0)) => self.lock().threshold[ctx.index()] as u64,
            Some((ctx, 4)) => self.claim(ctx) as u64,
            _ => 0,
        })
    }

    fn write(
        &mut self,
        addr: u64,
        size: AccessSize,
        data: u64,
        _rmw: Rmw,
    ) -> Result<u64, FatalError> {
        if size != AccessSize::Word {
            return Ok(0);
        }
        let value = data as u32;
        if addr < PRIORITY_END {
            self.set_priority((addr >> 2) as u32, value);
        } else if addr == PENDING {
            // Pending bits follow the device lines.
        } else if addr < CONTEXT_BASE {
            if let Some((ctx, 0)) = Self::context_at(addr, ENABLE_BASE, ENABLE_STRIDE) {
                self.set_enable(ctx, value);
            }
        } else {
            match Self::context_at(addr, CONTEXT_BASE, CONTEXT_STRIDE) {
                Some((ctx, 0)) => self.set_threshold(ctx, value),
                Some((ctx, 4)) => self.complete(ctx, value & 0xffff),
                _ => {}
            }
        }
        Ok(0)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_claim_complete_supervisor_context() {
        let mut plic = InterruptAggregator::new();
        plic.set_priority(1, 5);
        plic.set_priority(10, 3);
        let enable = (1u64 << 1) | (1u64 << 10);
        plic.write(ENABLE_BASE + ENABLE_STRIDE, AccessSize::Word, enable, Rmw::None)
            .unwrap();
        plic.write(CONTEXT_BASE + CONTEXT_STRIDE, AccessSize::Word, 0, Rmw::None)
            .unwrap();
        plic.signal(1);
        plic.signal(10);
        assert!(plic.poll_external(Context::Supervisor));
        assert!(!plic.poll_external(Context::Machine));

        // Highest priority first, then the next one while 1 is in flight.
        assert_eq!(plic.claim(Context::Supervisor), 1);
        assert_eq!(plic.claim(Context::Supervisor), 10);
        assert!(!plic.poll_external(Context::Supervisor));

        // Complete source 1 through MMIO; it becomes claimable again.
        plic.write(CONTEXT_BASE + CONTEXT_STRIDE + 4, AccessSize::Word, 1, Rmw::None)
            .unwrap();
        assert_eq!(
            plic.read(CONTEXT_BASE + CONTEXT_STRIDE + 4, AccessSize::Word, Rmw::None)
                .unwrap(),
            1
        );
    }

    #[test]
    fn test_threshold_and_lower() {
        let plic = InterruptAggregator::new();
        plic.set_priority(UART_IRQ, 1);
        plic.set_enable(Context::Machine, 1 << UART_IRQ);
        plic.signal(UART_IRQ);
        assert!(plic.poll_external(Context::Machine));

        plic.set_threshold(Context::Machine, 1);
        assert!(!plic.poll_external(Context::Machine));
        plic.set_threshold(Context::Machine, 0);

        plic.lower(UART_IRQ);
        assert!(!plic.poll_external(Context::Machine));
        assert_eq!(plic.claim(Context::Machine), 0);
    }

    #[test]
    fn test_signal_from_another_thread() {
        let plic = InterruptAggregator::new();
        plic.set_priority(3, 1);
        plic.set_enable(Context::Supervisor, 1 << 3);
        let remote = plic.clone();
        std::thread::spawn(move || remote.signal(3)).join().unwrap();
        assert!(plic.poll_external(Context::Supervisor));
    }

    #[test]
    fn test_export_import() {
        let plic = InterruptAggregator::new();
        plic.set_priority(UART_IRQ, 2);
        plic.set_enable(Context::Machine, 1 << UART_IRQ);
        plic.signal(UART_IRQ);
        let snap = plic.export();

        let other = InterruptAggregator::new();
        other.import(&snap);
        assert!(other.poll_external(Context::Machine));
        assert_eq!(other.claim(Context::Machine), UART_IRQ);
    }

    #[test]
    fn test_mmio_registers() {
        let mut plic = InterruptAggregator::new();
        plic.write(4 * 7, AccessSize::Word, 6, Rmw::None).unwrap();
        assert_eq!(plic.read(4 * 7, AccessSize::Word, Rmw::None).unwrap(), 6);
        plic.signal(7);
        assert_eq!(plic.read(PENDING, AccessSize::Word, Rmw::None).unwrap(), 1 << 7);
        // Writes to pending are ignored; byte accesses read zero.
        plic.write(PENDING, AccessSize::Word, 0, Rmw::None).unwrap();
        assert_eq!(plic.read(PENDING, AccessSize::Word, Rmw::None).unwrap(), 1 << 7);
        assert_eq!(plic.read(PENDING, AccessSize::Byte, Rmw::None).unwrap(), 0);
    }
}
