//! COM1 transmitter backed by [`vm_superio::Serial`].
//!
//! Only the transmit holding register at [`COM1_BASE`] is routed here.
//! Each byte the guest writes there goes to the sink verbatim, with no
//! line discipline or flow control.  Reads and the other UART registers
//! never reach the device, so the 16550 stays in its reset state (no
//! DLAB, no interrupts enabled) and offset 0 always means "transmit".

use std::io::{self, Write};

use vm_superio::serial::{Error as SerialError, NoEvents};
use vm_superio::Trigger;

/// Base I/O port for COM1 (standard PC/AT); the transmit holding register.
pub const COM1_BASE: u16 = 0x3F8;

/// Register offset of the transmit holding register.
const THR_OFFSET: u8 = 0;

/// Interrupt trigger for a UART with no IRQ line wired up.
///
/// The guest can only enable UART interrupts through the IER, which is
/// never routed to the device, so this is never fired in practice.
pub struct NoInterrupt;

impl Trigger for NoInterrupt {
    type E = io::Error;

    fn trigger(&self) -> Result<(), Self::E> {
        Ok(())
    }
}

/// The COM1 data port forwarding to `W`, with a byte count.
pub struct Serial<W: Write> {
    uart: vm_superio::Serial<NoInterrupt, NoEvents, W>,
    bytes_written: u64,
}

impl<W: Write> Serial<W> {
    pub fn new(out: W) -> Self {
        Self {
            uart: vm_superio::Serial::new(NoInterrupt, out),
            bytes_written: 0,
        }
    }

    /// Write one byte to the transmit holding register.  The UART flushes
    /// the sink after every byte.
    pub fn transmit(&mut self, byte: u8) -> io::Result<()> {
        self.uart.write(THR_OFFSET, byte).map_err(|e| match e {
            SerialError::IOError(e) => e,
            other => io::Error::other(format!("{other:?}")),
        })?;
        self.bytes_written += 1;
        Ok(())
    }

    /// Total bytes forwarded so far.
    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    pub fn get_ref(&self) -> &W {
        self.uart.writer()
    }

    pub fn into_inner(self) -> W {
        self.uart.into_writer()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_pass_through_verbatim() {
        let mut serial = Serial::new(Vec::new());
        for &b in b"xv6...\r\n\x00\xff" {
            serial.transmit(b).unwrap();
        }
        assert_eq!(serial.bytes_written(), 10);
        assert_eq!(serial.into_inner(), b"xv6...\r\n\x00\xff");
    }

    #[test]
    fn each_byte_is_flushed() {
        #[derive(Default)]
        struct Counting {
            data: Vec<u8>,
            flushes: usize,
        }
        impl Write for Counting {
            fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
                self.data.extend_from_slice(buf);
                Ok(buf.len())
            }
            fn flush(&mut self) -> io::Result<()> {
                self.flushes += 1;
                Ok(())
            }
        }

        let mut serial = Serial::new(Counting::default());
        serial.transmit(b'o').unwrap();
        serial.transmit(b'k').unwrap();
        assert_eq!(serial.get_ref().data, b"ok");
        assert!(serial.get_ref().flushes >= 2);
    }

    #[test]
    fn sink_errors_propagate() {
        struct Broken;
        impl Write for Broken {
            fn write(&mut self, _: &[u8]) -> io::Result<usize> {
                Err(io::Error::other("sink closed"))
            }
            fn flush(&mut self) -> io::Result<()> {
                Ok(())
            }
        }

        let mut serial = Serial::new(Broken);
        let err = serial.transmit(b'x').unwrap_err();
        assert_eq!(err.to_string(), "sink closed");
        assert_eq!(serial.bytes_written(), 0);
    }
}
