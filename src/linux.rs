use std::io::ErrorKind as IoErrorKind;
use std::path::Path;
use std::time::Duration;

use serial_core::{
    BaudRate, CharSize, Error as SerialError, ErrorKind, FlowControl, Parity, SerialDevice as _,
    SerialPortSettings as _, StopBits,
};
use linux_embedded_hal::{Delay, Serial};

use crate::{LinkMode, Options, Programmer, SerialPort};

fn io_kind(e: SerialError) -> IoErrorKind {
    match e.kind() {
        ErrorKind::NoDevice => IoErrorKind::NotFound,
        ErrorKind::InvalidInput => IoErrorKind::InvalidInput,
        ErrorKind::Io(kind) => kind,
    }
}

impl SerialPort<IoErrorKind> for Serial {
    fn set_rts(&mut self, level: bool) -> Result<(), IoErrorKind> {
        self.0.set_rts(level).map_err(io_kind)
    }
    fn set_dtr(&mut self, level: bool) -> Result<(), IoErrorKind> {
        self.0.set_dtr(level).map_err(io_kind)
    }
}

impl Programmer<Serial, Delay, IoErrorKind> {
    /// Create a new linux serial port programmer instance
    pub fn linux<P: AsRef<Path>>(
        port: P,
        baud: usize,
        options: Options,
    ) -> Result<Self, SerialError> {
        // Open port
        let mut port = Serial::open(port.as_ref())?;

        // Apply settings, the ROM bootloader expects 8E1 on UART and 8N1 on single-wire links
        let mut settings = port.0.read_settings()?;

        settings.set_char_size(CharSize::Bits8);
        settings.set_stop_bits(StopBits::Stop1);
        settings.set_baud_rate(BaudRate::from_speed(baud))?;
        settings.set_flow_control(FlowControl::FlowNone);
        settings.set_parity(match options.link_mode() {
            LinkMode::Uart => Parity::ParityEven,
            LinkMode::SingleWire => Parity::ParityNone,
        });

        port.0.write_settings(&settings)?;

        // reads block for this long before reporting WouldBlock
        port.0.set_timeout(Duration::from_millis(options.poll_delay_ms.max(1) as u64))?;

        debug!("Opened serial port at {} baud ({:?})", baud, options.link_mode());

        // Return instance
        Ok(Self::new(port, Delay {}, options))
    }
}
