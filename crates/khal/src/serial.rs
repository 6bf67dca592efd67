//! COM1 serial output, the kernel's text sink.
//!
//! The logging macros in `klog` format into this module. Output is a
//! write-only stream; nothing in the core reads from the UART.

use core::fmt;

use spin::Mutex;

#[cfg(target_arch = "x86")]
const COM1: u16 = 0x3F8;

struct SerialPort;

static SERIAL: Mutex<SerialPort> = Mutex::new(SerialPort);

impl SerialPort {
    #[cfg(target_arch = "x86")]
    fn init(&mut self) {
        use crate::port::{inb, outb};
        // 38400 baud, 8N1, FIFO on. The sequence follows the 16550A
        // programming model: unlock the divisor latch, program the
        // divisor, then restore data mode.
        unsafe {
            outb(COM1 + 1, 0x00); // mask UART interrupts, we poll
            outb(COM1 + 3, 0x80); // DLAB on
            outb(COM1 + 0, 0x03); // divisor low: 38400 baud
            outb(COM1 + 1, 0x00); // divisor high
            outb(COM1 + 3, 0x03); // 8 bits, no parity, one stop, DLAB off
            outb(COM1 + 2, 0xC7); // FIFO on, clear, 14-byte threshold
            outb(COM1 + 4, 0x0B); // DTR + RTS + OUT2
            let _ = inb(COM1); // drain any stale byte
        }
    }

    #[cfg(target_arch = "x86")]
    fn put_byte(&mut self, byte: u8) {
        use crate::port::{inb, outb};
        // SAFETY: COM1 is the conventional debug UART; polling the
        // line-status register until the transmit holding register is
        // empty is the documented way to pace it.
        unsafe {
            while inb(COM1 + 5) & 0x20 == 0 {
                core::hint::spin_loop();
            }
            outb(COM1, byte);
        }
    }

    #[cfg(not(target_arch = "x86"))]
    fn init(&mut self) {}

    #[cfg(not(target_arch = "x86"))]
    fn put_byte(&mut self, _byte: u8) {
        // Hosted builds discard kernel text; the test harness has its
        // own reporting channel.
    }
}

impl fmt::Write for SerialPort {
    fn write_str(&mut self, s: &str) -> fmt::Result {
        for byte in s.bytes() {
            if byte == b'\n' {
                self.put_byte(b'\r');
            }
            self.put_byte(byte);
        }
        Ok(())
    }
}

/// Programs the UART. Call once during early boot, before the first log
/// line.
pub fn init() {
    SERIAL.lock().init();
}

/// Writes a string to the serial sink.
pub fn write_str(s: &str) {
    use fmt::Write;
    let _ = SERIAL.lock().write_str(s);
}

/// Writes preformatted arguments to the serial sink.
pub fn write_fmt(args: fmt::Arguments) {
    use fmt::Write;
    let _ = SERIAL.lock().write_fmt(args);
}
