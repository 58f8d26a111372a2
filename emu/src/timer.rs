use crate::address_space::{AccessSize, Device, Rmw};
use crate::error::FatalError;
use std::io;
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

pub const CLINT_BASE: u64 = 0x0200_0000;
pub const CLINT_SIZE: u64 = 0x10000;

pub const MSIP_OFFSET: u64 = 0x0000;
pub const MTIMECMP_OFFSET: u64 = 0x4000;
pub const MTIME_OFFSET: u64 = 0xbff8;

/// 10 MHz, the usual `timebase-frequency` for virt-style boards.
pub const DEFAULT_TIMEBASE_HZ: u64 = 10_000_000;

/// Longest single sleep of the timer thread; it re-checks after this.
const MAX_SLEEP: Duration = Duration::from_secs(1);

/// Monotonic tick source shared by `mtime` and the `time` CSR.
#[derive(Debug, Clone, Copy)]
pub struct Timebase {
    origin: Instant,
    hz: u64,
    offset: u64,
}

impl Timebase {
    pub fn new(hz: u64) -> Self {
        Self::resume(hz, 0)
    }

    /// A timebase whose first reading is `ticks` (snapshot restore).
    pub fn resume(hz: u64, ticks: u64) -> Self {
        Self {
            origin: Instant::now(),
            hz: hz.max(1),
            offset: ticks,
        }
    }

    pub fn hz(&self) -> u64 {
        self.hz
    }

    /// Current tick count.
    pub fn now(&self) -> u64 {
        let nanos = self.origin.elapsed().as_nanos();
        let ticks = nanos * self.hz as u128 / 1_000_000_000;
        self.offset.wrapping_add(ticks as u64)
    }

    /// Host duration covering `ticks` timer ticks.
    pub fn duration(&self, ticks: u64) -> Duration {
        let nanos = ticks as u128 * 1_000_000_000 / self.hz as u128;
        Duration::from_nanos(nanos.min(u64::MAX as u128) as u64)
    }
}

impl Default for Timebase {
    fn default() -> Self {
        Self::new(DEFAULT_TIMEBASE_HZ)
    }
}

struct TimerState {
    mtimecmp: u64,
    msip: bool,
    pending: bool,
    shutdown: bool,
}

struct Shared {
    state: Mutex<TimerState>,
    wake: Condvar,
    timebase: Timebase,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, TimerState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Core-local timer. Owns the deadline thread; dropping it stops the thread.
pub struct Timer {
    shared: Arc<Shared>,
    worker: Option<JoinHandle<()>>,
}

impl Timer {
    pub fn start(timebase: Timebase) -> io::Result<Self> {
        let shared = Arc::new(Shared {
            state: Mutex::new(TimerState {
                mtimecmp: u64::MAX,
                msip: false,
                pending: false,
                shutdown: false,
            }),
            wake: Condvar::new(),
            timebase,
        });
        let thread_shared = shared.clone();
        let worker = thread::Builder::new()
            .name("timer".to_string())
            .spawn(move || run_deadline_loop(&thread_shared))?;
        Ok(Self {
            shared,
            worker: Some(worker),
        })
    }

    pub fn handle(&self) -> TimerHandle {
        TimerHandle {
            shared: self.shared.clone(),
        }
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.shared.lock().shutdown = true;
        self.shared.wake.notify_all();
        if let Some(worker) = self.worker.take() {
            let _ = worker.join();
        }
    }
}

/// Sleeps until `mtimecmp`, raises the pending flag, then waits for the
/// guest to program a new deadline.
fn run_deadline_loop(shared: &Shared) {
    let mut state = shared.lock();
    loop {
        if state.shutdown {
            return;
        }
        let now = shared.timebase.now();
        if state.mtimecmp <= now {
            if !state.pending {
                log::trace!("timer: deadline {:#x} reached at {:#x}", state.mtimecmp, now);
            }
            state.pending = true;
            state = shared.wake.wait(state).unwrap_or_else(|e| e.into_inner());
        } else {
            let sleep = shared
                .timebase
                .duration(state.mtimecmp - now)
                .min(MAX_SLEEP);
            state = shared
                .wake
                .wait_timeout(state, sleep)
                .map(|(guard, _)| guard)
                .unwrap_or_else(|e| e.into_inner().0);
        }
    }
}

/// Cloneable access to the timer: MMIO device, interrupt poll, and state
/// for snapshots.
#[derive(Clone)]
pub struct TimerHandle {
    shared: Arc<Shared>,
}

impl TimerHandle {
    pub fn timebase(&self) -> Timebase {
        self.shared.timebase
    }

    pub fn mtime(&self) -> u64 {
        self.shared.timebase.now()
    }

    pub fn mtimecmp(&self) -> u64 {
        self.shared.lock().mtimecmp
    }

    pub fn set_mtimecmp(&self, value: u64) {
        let mut state = self.shared.lock();
        state.mtimecmp = value;
        state.pending = value <= self.shared.timebase.now();
        log::trace!("timer: mtimecmp={:#x} pending={}", value, state.pending);
        drop(state);
        self.shared.wake.notify_all();
    }

    pub fn set_msip(&self, raised: bool) {
        self.shared.lock().msip = raised;
    }

    /// Machine timer interrupt line.
    pub fn poll_timer(&self) -> bool {
        self.shared.lock().pending
    }

    /// Machine software interrupt line.
    pub fn poll_software(&self) -> bool {
        self.shared.lock().msip
    }
}

impl Device for TimerHandle {
    fn read(&mut self, addr: u64, size: AccessSize, _rmw: Rmw) -> Result<u64, FatalError> {
        let value = match (addr, size) {
            (MSIP_OFFSET, AccessSize::Word) => self.poll_software() as u64,
            (MTIMECMP_OFFSET, AccessSize::Double) => self.mtimecmp(),
            (MTIMECMP_OFFSET, AccessSize::Word) => self.mtimecmp() & 0xffff_ffff,
            (o, AccessSize::Word) if o == MTIMECMP_OFFSET + 4 => self.mtimecmp() >> 32,
            (MTIME_OFFSET, AccessSize::Double) => self.mtime(),
            (MTIME_OFFSET, AccessSize::Word) => self.mtime() & 0xffff_ffff,
            (o, AccessSize::Word) if o == MTIME_OFFSET + 4 => self.mtime() >> 32,
            // Other harts and odd sizes read as zero.
            _ => 0,
        };
        Ok(value)
    }

    fn write(
        &mut self,
        addr: u64,
        size: AccessSize,
        data: u64,
        _rmw: Rmw,
    ) -> Result<u64, FatalError> {
        match (addr, size) {
            (MSIP_OFFSET, AccessSize::Word) => self.set_msip(data & 1 != 0),
            (MTIMECMP_OFFSET, AccessSize::Double) => self.set_mtimecmp(data),
            (MTIMECMP_OFFSET, AccessSize::Word) => {
                let current = self.mtimecmp();
                self.set_mtimecmp((current & 0xffff_ffff_0000_0000) | (data & 0xffff_ffff));
            }
            (o, AccessSize::Word) if o == MTIMECMP_OFFSET + 4 => {
                let current = self.mtimecmp();
                self.set_mtimecmp((current & 0x0000_0000_ffff_ffff) | (data << 32));
            }
            // mtime follows the host clock and ignores writes.
            _ => {}
        }
        Ok(0)
    }
}
