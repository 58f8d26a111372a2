use crate::address_space::{AddressSpace, ROOT_END, ROOT_START};
use crate::cpu::CpuState;
use crate::error::FatalError;
use crate::finisher::{FinishStatus, TestFinisher, FINISHER_BASE, FINISHER_SIZE};
use crate::interrupt::{Context, InterruptAggregator, PLIC_BASE, PLIC_SIZE};
use crate::loader::{self, LoadError};
use crate::memory::{Ram, Rom, RAM_BASE, ROM_BASE};
use crate::mmu::PAGE_SIZE;
use crate::snapshot::{
    CpuSnapshot, DeviceSnapshot, MemRegionSnapshot, Snapshot, SnapshotError, TimerSnapshot,
    SNAPSHOT_VERSION,
};
use crate::timer::{Timebase, Timer, TimerHandle, CLINT_BASE, CLINT_SIZE, DEFAULT_TIMEBASE_HZ};
use crate::trace::{TraceWindow, Tracer};
use crate::trap::InterruptSource;
use crate::uart::{Uart, UART_BASE, UART_SIZE};
use std::io;

/// Default RAM size.
pub const DEFAULT_RAM_MIB: usize = 128;

/// Board parameters, filled from the command line or by tests.
#[derive(Debug, Clone)]
pub struct MachineConfig {
    /// RAM size in bytes.
    pub ram_size: usize,
    pub timebase_hz: u64,
    pub trace: TraceWindow,
}

impl Default for MachineConfig {
    fn default() -> Self {
        Self {
            ram_size: DEFAULT_RAM_MIB * 1024 * 1024,
            timebase_hz: DEFAULT_TIMEBASE_HZ,
            trace: TraceWindow::default(),
        }
    }
}

/// Why `run` returned.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitReason {
    /// The guest wrote to the test finisher.
    Finished(FinishStatus),
    /// The step budget ran out.
    StepLimit,
}

/// The hart's interrupt lines, wired to the board devices.
struct Platform {
    plic: InterruptAggregator,
    timer: TimerHandle,
}

impl InterruptSource for Platform {
    fn poll_external(&self, context: Context) -> bool {
        self.plic.poll_external(context)
    }

    fn poll_timer(&self) -> bool {
        self.timer.poll_timer()
    }

    fn poll_software(&self) -> bool {
        self.timer.poll_software()
    }
}

/// One hart plus the virt-style board around it.
pub struct Machine {
    pub cpu: CpuState,
    pub bus: AddressSpace,
    platform: Platform,
    uart: Uart,
    finisher: TestFinisher,
    tracer: Tracer,
    config: MachineConfig,
    // Owns the deadline thread; dropped last.
    _timer: Timer,
}

impl Machine {
    pub fn new(config: MachineConfig) -> io::Result<Self> {
        let timebase = Timebase::new(config.timebase_hz);
        Self::with_timebase(config, timebase)
    }

    fn with_timebase(config: MachineConfig, timebase: Timebase) -> io::Result<Self> {
        let timer = Timer::start(timebase)?;
        let plic = InterruptAggregator::new();
        let uart = Uart::new(plic.clone());
        let finisher = TestFinisher::new();

        let mut bus = AddressSpace::new(ROOT_START, ROOT_END);
        let root = AddressSpace::ROOT;
        bus.attach(
            root,
            "finisher",
            FINISHER_BASE,
            FINISHER_BASE + FINISHER_SIZE - 1,
            finisher.clone(),
        );
        bus.attach(root, "clint", CLINT_BASE, CLINT_BASE + CLINT_SIZE - 1, timer.handle());
        bus.attach(root, "plic", PLIC_BASE, PLIC_BASE + PLIC_SIZE - 1, plic.clone());
        bus.attach(root, "uart", UART_BASE, UART_BASE + UART_SIZE - 1, uart.clone());
        bus.attach(
            root,
            "ram",
            RAM_BASE,
            RAM_BASE + config.ram_size as u64 - 1,
            Ram::new(config.ram_size),
        );

        log::info!(
            "machine: {} MiB RAM at {:#x}, timebase {} Hz",
            config.ram_size / (1024 * 1024),
            RAM_BASE,
            timebase.hz()
        );

        Ok(Self {
            cpu: CpuState::new(RAM_BASE, timebase),
            bus,
            platform: Platform {
                plic,
                timer: timer.handle(),
            },
            uart,
            finisher,
            tracer: Tracer::new(config.trace, Default::default()),
            config,
            _timer: timer,
        })
    }

    pub fn config(&self) -> &MachineConfig {
        &self.config
    }

    pub fn uart(&self) -> &Uart {
        &self.uart
    }

    pub fn finish_status(&self) -> Option<FinishStatus> {
        self.finisher.status()
    }

    /// Map a boot ROM at `ROM_BASE` and start executing from it. The image
    /// must fit below the finisher.
    pub fn load_rom(&mut self, image: Vec<u8>) -> Result<(), LoadError> {
        let max = FINISHER_BASE - ROM_BASE;
        let size = (image.len() as u64).div_ceil(PAGE_SIZE).max(1) * PAGE_SIZE;
        if size > max {
            return Err(LoadError::RomTooLarge {
                size: image.len() as u64,
                max,
            });
        }
        log::info!("machine: {} byte ROM at {:#x}", image.len(), ROM_BASE);
        self.bus.attach(
            AddressSpace::ROOT,
            "rom",
            ROM_BASE,
            ROM_BASE + size - 1,
            Rom::new(image, size as usize),
        );
        self.cpu.pc = ROM_BASE;
        Ok(())
    }

    /// Copy a flat image to `addr` and start executing there.
    pub fn load_raw(&mut self, image: &[u8], addr: u64) -> Result<(), FatalError> {
        self.bus.write_blob(addr, image)?;
        log::info!("machine: {} byte image at {:#x}", image.len(), addr);
        self.cpu.pc = addr;
        Ok(())
    }

    /// Load an ELF image into RAM, jump to its entry point and pick up its
    /// symbols for the trace log.
    pub fn load_elf(&mut self, image: &[u8]) -> Result<(), LoadError> {
        let loaded = loader::load_elf(
            &mut self.bus,
            image,
            RAM_BASE,
            self.config.ram_size as u64,
        )?;
        self.cpu.pc = loaded.entry;
        self.tracer.set_symbols(loaded.symbols);
        Ok(())
    }

    pub fn step(&mut self) -> Result<(), FatalError> {
        self.cpu
            .step(&mut self.bus, &self.platform, Some(&self.tracer))
    }

    /// Step until the guest stops the machine or `max_steps` instructions
    /// have been attempted.
    pub fn run(&mut self, max_steps: Option<u64>) -> Result<ExitReason, FatalError> {
        let mut steps = 0u64;
        loop {
            if let Some(status) = self.finisher.status() {
                return Ok(ExitReason::Finished(status));
            }
            if max_steps.is_some_and(|max| steps >= max) {
                return Ok(ExitReason::StepLimit);
            }
            self.step()?;
            steps += 1;
        }
    }

    fn read_ram(&mut self) -> Result<Vec<u8>, FatalError> {
        let mut data = vec![0u8; self.config.ram_size];
        self.bus.read_blob(RAM_BASE, &mut data)?;
        Ok(data)
    }

    /// Capture the hart, device and RAM state.
    pub fn snapshot(&mut self) -> Result<Snapshot, FatalError> {
        let cpu = CpuSnapshot {
            pc: self.cpu.pc,
            mode: self.cpu.csr.mode(),
            regs: self.cpu.regs.clone(),
            csrs: self.cpu.csr.export(),
            retired: self.cpu.csr.retired(),
        };
        let timer = &self.platform.timer;
        let devices = DeviceSnapshot {
            timer: TimerSnapshot {
                hz: timer.timebase().hz(),
                mtime: timer.mtime(),
                mtimecmp: timer.mtimecmp(),
                msip: timer.poll_software(),
            },
            plic: self.platform.plic.export(),
            uart: self.uart.export(),
        };
        let region = MemRegionSnapshot::capture(RAM_BASE, self.read_ram()?);

        Ok(Snapshot {
            version: SNAPSHOT_VERSION.to_string(),
            cpu,
            devices,
            memory: vec![region],
        })
    }

    /// Build a machine from a snapshot. `config` must describe the same RAM
    /// size; time resumes from the captured `mtime`.
    pub fn restore(config: MachineConfig, snapshot: &Snapshot) -> Result<Self, SnapshotError> {
        snapshot.check_version()?;
        let region = snapshot
            .memory
            .first()
            .ok_or(SnapshotError::MissingRegion)?;
        region.verify(RAM_BASE, config.ram_size as u64)?;

        let t = &snapshot.devices.timer;
        let mut machine = Self::with_timebase(config, Timebase::resume(t.hz, t.mtime))?;

        machine.cpu.pc = snapshot.cpu.pc;
        machine.cpu.regs = snapshot.cpu.regs.clone();
        machine
            .cpu
            .csr
            .import(&snapshot.cpu.csrs, snapshot.cpu.mode, snapshot.cpu.retired);

        machine.platform.timer.set_mtimecmp(t.mtimecmp);
        machine.platform.timer.set_msip(t.msip);
        machine.platform.plic.import(&snapshot.devices.plic);
        machine.uart.import(&snapshot.devices.uart);
        machine.bus.write_blob(RAM_BASE, &region.data)?;

        log::info!(
            "machine: restored at pc={:#x} ({:?}), {} instructions retired",
            machine.cpu.pc,
            snapshot.cpu.mode,
            snapshot.cpu.retired
        );
        Ok(machine)
    }
}
