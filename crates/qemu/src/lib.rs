#![no_std]

use core::fmt;
use core::fmt::Write;

use spin::Mutex;
use uart_16550::SerialPort;

/// COM1, where Qemu forwards the `-serial` output.
const COM1: u16 = 0x3F8;

/// Serial port used to log to stdout when running in Qemu.
static SERIAL_PORT: Mutex<Option<SerialPort>> = Mutex::new(None);

// ———————————————————————————— Print Utilities ————————————————————————————— //

#[macro_export]
macro_rules! print {
    ($($arg:tt)*) => {
        $crate::_print(core::format_args!($($arg)*));
    };
}

#[macro_export]
macro_rules! println {
    () => ($crate::print!("\n"));
    ($($arg:tt)*) => ($crate::print!("{}\n", core::format_args!($($arg)*)));
}

/// Internal function used to print to stdout when running in Qemu.
///
/// The port is initialized on first use. Output is dropped if the port rejects it.
pub fn _print(args: fmt::Arguments) {
    let mut port = SERIAL_PORT.lock();
    let serial = port.get_or_insert_with(|| {
        // SAFETY: COM1 is only accessed through this lock.
        let mut serial = unsafe { SerialPort::new(COM1) };
        serial.init();
        serial
    });
    let _ = serial.write_fmt(args);
}
