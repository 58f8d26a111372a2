use crate::uart::Uart;
use std::io::{self, Read};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;

/// Ctrl-A, the escape prefix; Ctrl-A x asks the run loop to stop.
const ESCAPE: u8 = 0x01;

/// Host terminal bridge: stdin bytes go into the UART receive FIFO.
pub struct Console {
    original_termios: Option<libc::termios>,
    quit: Arc<AtomicBool>,
}

impl Console {
    pub fn start(uart: Uart) -> io::Result<Self> {
        let quit = Arc::new(AtomicBool::new(false));
        let original_termios = enter_raw_mode();

        let quit_flag = quit.clone();
        thread::Builder::new()
            .name("console".to_string())
            .spawn(move || {
                let mut buf = [0u8; 1];
                let stdin = io::stdin();
                let mut handle = stdin.lock();
                let mut escaped = false;

                // One blocking read per byte.
                while handle.read_exact(&mut buf).is_ok() {
                    let byte = buf[0];
                    if escaped {
                        escaped = false;
                        if byte == b'x' {
                            log::info!("console: quit requested");
                            quit_flag.store(true, Ordering::Relaxed);
                            break;
                        }
                        if byte != ESCAPE {
                            uart.push_input(ESCAPE);
                        }
                    } else if byte == ESCAPE {
                        escaped = true;
                        continue;
                    }
                    log::debug!("console: rx {:#04x}", byte);
                    uart.push_input(byte);
                }
            })?;

        Ok(Self {
            original_termios,
            quit,
        })
    }

    pub fn quit_requested(&self) -> bool {
        self.quit.load(Ordering::Relaxed)
    }
}

/// Raw input, but keep OPOST so guest newlines still render.
fn enter_raw_mode() -> Option<libc::termios> {
    if unsafe { libc::isatty(libc::STDIN_FILENO) } != 1 {
        return None;
    }
    let mut termios: libc::termios = unsafe { std::mem::zeroed() };
    if unsafe { libc::tcgetattr(libc::STDIN_FILENO, &mut termios) } != 0 {
        return None;
    }
    let mut raw = termios;
    raw.c_iflag &= !(libc::BRKINT | libc::ICRNL | libc::INPCK | libc::ISTRIP | libc::IXON);
    raw.c_lflag &= !(libc::ECHO | libc::ICANON | libc::ISIG | libc::IEXTEN);
    raw.c_cflag |= libc::CS8;
    raw.c_cc[libc::VMIN] = 1;
    raw.c_cc[libc::VTIME] = 0;
    if unsafe { libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, &raw) } != 0 {
        log::warn!("console: could not switch stdin to raw mode");
        return None;
    }
    Some(termios)
}

impl Drop for Console {
    fn drop(&mut self) {
        if let Some(termios) = self.original_termios {
            unsafe {
                libc::tcsetattr(libc::STDIN_FILENO, libc::TCSANOW, &termios);
            }
        }
    }
}
