use clap::Parser;
use rv64_emu::console::Console;
use rv64_emu::machine::{ExitReason, Machine, MachineConfig, DEFAULT_RAM_MIB};
use rv64_emu::memory::RAM_BASE;
use rv64_emu::snapshot::Snapshot;
use rv64_emu::timer::DEFAULT_TIMEBASE_HZ;
use rv64_emu::trace::{dump_registers, TraceWindow};
use std::io::Write;
use std::path::PathBuf;

/// Instructions executed between host I/O polls.
const SLICE: u64 = 10_000;

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the image to boot (ELF or raw binary)
    #[arg(short, long, required_unless_present = "restore")]
    kernel: Option<PathBuf>,

    /// Address to load a raw image at
    #[arg(long, default_value_t = RAM_BASE, value_parser = parse_addr)]
    load_addr: u64,

    /// Optional boot ROM image, mapped at 0x1000
    #[arg(long)]
    bios: Option<PathBuf>,

    /// RAM size in MiB
    #[arg(long, default_value_t = DEFAULT_RAM_MIB as u64,
          value_parser = clap::value_parser!(u64).range(1..))]
    mem_mib: u64,

    /// Timer frequency in Hz
    #[arg(long, default_value_t = DEFAULT_TIMEBASE_HZ)]
    timebase_hz: u64,

    /// Stop after this many instructions
    #[arg(long)]
    max_steps: Option<u64>,

    /// First pc of the trace window (RUST_LOG=trace)
    #[arg(long, value_parser = parse_addr)]
    trace_from: Option<u64>,

    /// Last pc of the trace window
    #[arg(long, value_parser = parse_addr)]
    trace_to: Option<u64>,

    /// Write a snapshot here when the machine stops
    #[arg(long)]
    snapshot_out: Option<PathBuf>,

    /// Resume from a snapshot instead of booting an image
    #[arg(long)]
    restore: Option<PathBuf>,
}

/// Accepts `0x`-prefixed hex (underscores allowed) or decimal.
fn parse_addr(s: &str) -> Result<u64, String> {
    let cleaned = s.replace('_', "");
    let parsed = match cleaned.strip_prefix("0x").or_else(|| cleaned.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => cleaned.parse(),
    };
    parsed.map_err(|e| format!("invalid address `{}`: {}", s, e))
}

/// Guest output is passed through unchanged; the console leaves OPOST on, so
/// the terminal still turns `\n` into `\r\n`.
fn flush_uart(machine: &Machine, out: &mut impl Write) {
    let _ = out.write_all(&machine.uart().drain_output());
    let _ = out.flush();
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    env_logger::init();
    let args = Args::parse();

    let ram_size = usize::try_from(args.mem_mib)
        .ok()
        .and_then(|mib| mib.checked_mul(1024 * 1024))
        .ok_or("requested memory size is too large")?;
    let config = MachineConfig {
        ram_size,
        timebase_hz: args.timebase_hz,
        trace: TraceWindow::new(args.trace_from, args.trace_to),
    };

    let mut machine = match &args.restore {
        Some(path) => Machine::restore(config, &Snapshot::load(path)?)?,
        None => {
            let mut machine = Machine::new(config)?;
            if let Some(kernel) = &args.kernel {
                let image = std::fs::read(kernel)?;
                if image.starts_with(b"\x7FELF") {
                    machine.load_elf(&image)?;
                } else {
                    machine.load_raw(&image, args.load_addr)?;
                }
            }
            if let Some(bios) = &args.bios {
                machine.load_rom(std::fs::read(bios)?)?;
            }
            machine
        }
    };

    log::info!("starting execution at {:#x}", machine.cpu.pc);
    let console = Console::start(machine.uart().clone())?;
    let stdout = std::io::stdout();
    let mut executed = 0u64;

    let status = loop {
        let slice = match args.max_steps {
            Some(max) if executed >= max => break None,
            Some(max) => SLICE.min(max - executed),
            None => SLICE,
        };
        let result = machine.run(Some(slice));
        executed += slice;
        flush_uart(&machine, &mut stdout.lock());

        match result {
            Ok(ExitReason::Finished(status)) => break Some(status),
            Ok(ExitReason::StepLimit) => {}
            Err(e) => {
                log::error!("fatal emulator error: {}", e);
                eprintln!("{}", dump_registers(&machine.cpu));
                drop(console);
                std::process::exit(1);
            }
        }
        if console.quit_requested() {
            log::info!("terminated by user");
            break None;
        }
    };
    drop(console);

    if let Some(path) = &args.snapshot_out {
        machine.snapshot()?.save(path)?;
    }

    log::info!(
        "stopped at pc={:#x} after {} instructions",
        machine.cpu.pc,
        machine.cpu.csr.retired()
    );
    if let Some(status) = status {
        let code = status.exit_code();
        if code != 0 {
            std::process::exit(code);
        }
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use rv64_emu::address_space::{AccessSize, Rmw};
    use rv64_emu::uart::UART_BASE;

    #[test]
    fn test_zero_memory_is_rejected() {
        assert!(Args::try_parse_from(["rv64-emu", "--kernel", "k", "--mem-mib", "0"]).is_err());
        let args = Args::try_parse_from(["rv64-emu", "--kernel", "k", "--mem-mib", "1"]).unwrap();
        assert_eq!(args.mem_mib, 1);
    }

    #[test]
    fn test_parse_addr() {
        assert_eq!(parse_addr("0x8000_0000"), Ok(0x8000_0000));
        assert_eq!(parse_addr("4096"), Ok(4096));
        assert!(parse_addr("0xZZ").is_err());
    }

    #[test]
    fn test_uart_output_is_not_translated() {
        let config = MachineConfig {
            ram_size: 0x1000,
            ..MachineConfig::default()
        };
        let mut machine = Machine::new(config).unwrap();
        for &byte in b"a\nb" {
            machine
                .bus
                .write(UART_BASE, AccessSize::Byte, byte as u64, Rmw::None)
                .unwrap();
        }
        let mut out = Vec::new();
        flush_uart(&machine, &mut out);
        assert_eq!(out, b"a\nb");
    }
}
