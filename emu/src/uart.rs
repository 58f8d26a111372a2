use crate::address_space::{AccessSize, Device, Rmw};
use crate::error::FatalError;
use crate::interrupt::{InterruptAggregator, UART_IRQ};
use crate::snapshot::UartSnapshot;
use std::collections::VecDeque;
use std::sync::{Arc, Mutex, MutexGuard};

pub const UART_BASE: u64 = 0x1000_0000;
pub const UART_SIZE: u64 = 0x100;

// Register offsets
const RBR: u64 = 0x00; // Receiver Buffer (read)
const THR: u64 = 0x00; // Transmitter Holding (write)
const IER: u64 = 0x01; // Interrupt Enable
const IIR: u64 = 0x02; // Interrupt Identity (read)
const FCR: u64 = 0x02; // FIFO Control (write)
const LCR: u64 = 0x03; // Line Control
const MCR: u64 = 0x04; // Modem Control
const LSR: u64 = 0x05; // Line Status
const MSR: u64 = 0x06; // Modem Status
const SCR: u64 = 0x07; // Scratch

const LCR_DLAB: u8 = 0x80;
const LSR_DATA_READY: u8 = 0x01;
const LSR_THR_EMPTY: u8 = 0x20;
const LSR_TX_IDLE: u8 = 0x40;
const IER_RX: u8 = 0x01;
const IER_THRE: u8 = 0x02;
const IIR_NONE: u8 = 0x01;
const IIR_THRE: u8 = 0x02;
const IIR_RX: u8 = 0x04;

struct UartState {
    input: VecDeque<u8>,
    output: VecDeque<u8>,

    ier: u8,
    iir: u8,
    fcr: u8,
    lcr: u8,
    mcr: u8,
    lsr: u8,
    msr: u8,
    scr: u8,

    dll: u8,
    dlm: u8,

    interrupting: bool,
    /// THR-empty interrupt latched until IIR is read or THR is written.
    thre_ip: bool,
}

impl UartState {
    fn new() -> Self {
        Self {
            input: VecDeque::new(),
            output: VecDeque::new(),
            ier: 0x00,
            iir: IIR_NONE,
            fcr: 0x00,
            lcr: 0x00,
            mcr: 0x00,
            lsr: LSR_THR_EMPTY | LSR_TX_IDLE,
            msr: 0x00,
            scr: 0x00,
            dll: 0x00,
            dlm: 0x00,
            interrupting: false,
            thre_ip: true,
        }
    }

    fn update_interrupts(&mut self) {
        self.interrupting = false;
        self.iir = IIR_NONE;

        if self.lsr & LSR_DATA_READY != 0 && self.ier & IER_RX != 0 {
            self.interrupting = true;
            self.iir = IIR_RX;
            return;
        }

        if self.thre_ip && self.ier & IER_THRE != 0 {
            self.interrupting = true;
            self.iir = IIR_THRE;
        }
    }

    fn dlab(&self) -> bool {
        self.lcr & LCR_DLAB != 0
    }

    fn load(&mut self, offset: u64) -> u8 {
        match offset {
            RBR if self.dlab() => self.dll,
            RBR => {
                let byte = self.input.pop_front().unwrap_or(0);
                if self.input.is_empty() {
                    self.lsr &= !LSR_DATA_READY;
                }
                self.update_interrupts();
                byte
            }
            IER if self.dlab() => self.dlm,
            IER => self.ier,
            IIR => {
                let val = self.iir;
                if val & 0x0F == IIR_THRE {
                    self.thre_ip = false;
                    self.update_interrupts();
                }
                // FIFOs are always reported enabled once FCR turned them on.
                if self.fcr & 0x01 != 0 {
                    val | 0xC0
                } else {
                    val
                }
            }
            LCR => self.lcr,
            MCR => self.mcr,
            LSR => self.lsr,
            MSR => self.msr,
            SCR => self.scr,
            _ => 0,
        }
    }

    fn store(&mut self, offset: u64, val: u8) {
        match offset {
            THR if self.dlab() => self.dll = val,
            THR => {
                log::trace!(
                    "uart: tx '{}' ({:#04x})",
                    if val.is_ascii_graphic() { val as char } else { '.' },
                    val
                );
                self.output.push_back(val);
                // Transmission is instantaneous: empty again right away.
                self.lsr |= LSR_THR_EMPTY | LSR_TX_IDLE;
                self.thre_ip = true;
                self.update_interrupts();
            }
            IER if self.dlab() => self.dlm = val,
            IER => {
                self.ier = val & 0x0F;
                self.update_interrupts();
            }
            FCR => {
                self.fcr = val;
                if val & 0x02 != 0 {
                    self.input.clear();
                    self.lsr &= !LSR_DATA_READY;
                }
                self.update_interrupts();
            }
            LCR => self.lcr = val,
            MCR => self.mcr = val,
            SCR => self.scr = val,
            // LSR and MSR are read-only.
            _ => {}
        }
    }
}

/// A minimal 16550 UART.
///
/// Cloning gives another handle to the same registers; the console thread
/// pushes input through one handle while the address space owns another.
/// The interrupt line to the aggregator is re-evaluated after every access.
#[derive(Clone)]
pub struct Uart {
    state: Arc<Mutex<UartState>>,
    plic: InterruptAggregator,
}

impl Uart {
    pub fn new(plic: InterruptAggregator) -> Self {
        Self {
            state: Arc::new(Mutex::new(UartState::new())),
            plic,
        }
    }

    fn lock(&self) -> MutexGuard<'_, UartState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn sync_irq(&self, interrupting: bool) {
        if interrupting {
            self.plic.signal(UART_IRQ);
        } else {
            self.plic.lower(UART_IRQ);
        }
    }

    /// Host side: a byte arrived from the terminal.
    pub fn push_input(&self, byte: u8) {
        let interrupting = {
            let mut state = self.lock();
            state.input.push_back(byte);
            state.lsr |= LSR_DATA_READY;
            state.update_interrupts();
            state.interrupting
        };
        self.sync_irq(interrupting);
    }

    /// Host side: take everything the guest has transmitted so far.
    pub fn drain_output(&self) -> Vec<u8> {
        self.lock().output.drain(..).collect()
    }

    pub fn export(&self) -> UartSnapshot {
        let state = self.lock();
        UartSnapshot {
            rx_fifo: state.input.iter().copied().collect(),
            tx_fifo: state.output.iter().copied().collect(),
            ier: state.ier,
            fcr: state.fcr,
            lcr: state.lcr,
            mcr: state.mcr,
            lsr: state.lsr,
            msr: state.msr,
            scr: state.scr,
            dll: state.dll,
            dlm: state.dlm,
            thre_ip: state.thre_ip,
        }
    }

    pub fn import(&self, snap: &UartSnapshot) {
        let interrupting = {
            let mut state = self.lock();
            state.input = snap.rx_fifo.iter().copied().collect();
            state.output = snap.tx_fifo.iter().copied().collect();
            state.ier = snap.ier;
            state.fcr = snap.fcr;
            state.lcr = snap.lcr;
            state.mcr = snap.mcr;
            state.lsr = snap.lsr;
            state.msr = snap.msr;
            state.scr = snap.scr;
            state.dll = snap.dll;
            state.dlm = snap.dlm;
            state.thre_ip = snap.thre_ip;
            state.update_interrupts();
            state.interrupting
        };
        self.sync_irq(interrupting);
    }
}

impl Device for Uart {
    fn read(&mut self, addr: u64, size: AccessSize, _rmw: Rmw) -> Result<u64, FatalError> {
        // The registers are byte wide; wider accesses read as zero.
        if size != AccessSize::Byte {
            return Ok(0);
        }
        let (value, interrupting) = {
            let mut state = self.lock();
            let value = state.load(addr);
            (value, state.interrupting)
        };
        self.sync_irq(interrupting);
        Ok(value as u64)
    }

    fn write(
        &mut self,
        addr: u64,
        size: AccessSize,
        data: u64,
        _rmw: Rmw,
    ) -> Result<u64, FatalError> {
        if size != AccessSize::Byte {
            return Ok(0);
        }
        let interrupting = {
            let mut state = self.lock();
            state.store(addr, data as u8);
            state.interrupting
        };
        self.sync_irq(interrupting);
        Ok(0)
    }
}
