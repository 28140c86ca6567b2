//! STM8 Serial Bootloader.
//!
//! Based on UM0560. Synchronises with the ROM bootloader, identifies the device,
//! uploads the flash write/erase routines it needs and then a user image.

use core::marker::PhantomData;
use std::fmt;
use std::time::{Duration, Instant};

#[macro_use]
extern crate log;

#[macro_use(block)]
extern crate nb;

extern crate embedded_hal;
use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

#[cfg(feature = "structopt")]
extern crate structopt;

#[cfg(feature = "linux")]
extern crate linux_embedded_hal;

#[cfg(feature = "linux")]
pub mod linux;

pub mod catalog;
pub mod checksum;
pub mod hexfile;
pub mod protocol;

mod commands;
mod upload;

#[cfg(test)]
mod sim;

pub use catalog::{DeviceDescriptor, FlashSize, RoutineDir, RoutineEntry, RoutineSource};
pub use hexfile::{Format, HexError, MemoryImage};
pub use upload::{Firmware, Progress, UploadPlan};

use protocol::{ACK, MAX_FRAME, NACK};

pub trait SerialPort<E>: Write<u8, Error = E> + Read<u8, Error = E> {
    fn set_rts(&mut self, level: bool) -> Result<(), E>;
    fn set_dtr(&mut self, level: bool) -> Result<(), E>;
}

/// Upload sequence state
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum State {
    Idle,
    Syncing,
    Identifying,
    HelperUpload,
    ImageUpload,
    Finalizing,
    Done,
    Failed,
}

/// Physical link to the bootloader
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum LinkMode {
    /// Separate RX and TX lines
    Uart,
    /// Single-wire (e.g. LIN) link, every transmitted byte is echoed back
    SingleWire,
}

/// Bootloader operation, with the address it targets
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Operation {
    Sync,
    GetInfo,
    Read(u32),
    Write(u32),
    Erase(u32),
    Go(u32),
}

/// Frame within an operation
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Frame {
    Command,
    Address,
    /// Byte count, followed by data for writes
    Data,
    Sector,
}

/// Location of a failed exchange
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct Step {
    pub op: Operation,
    pub frame: Frame,
}

impl Step {
    pub fn new(op: Operation, frame: Frame) -> Self {
        Self { op, frame }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::Sync => write!(f, "sync"),
            Operation::GetInfo => write!(f, "get info"),
            Operation::Read(a) => write!(f, "read @ 0x{:04x}", a),
            Operation::Write(a) => write!(f, "write @ 0x{:04x}", a),
            Operation::Erase(a) => write!(f, "erase @ 0x{:04x}", a),
            Operation::Go(a) => write!(f, "go @ 0x{:04x}", a),
        }
    }
}

impl fmt::Display for Step {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let frame = match self.frame {
            Frame::Command => "command",
            Frame::Address => "address",
            Frame::Data => "data",
            Frame::Sector => "sector",
        };
        write!(f, "{} ({} frame)", self.op, frame)
    }
}

#[derive(Clone, PartialEq, Debug, thiserror::Error)]
pub enum Error<E: fmt::Debug> {
    #[error("serial error: {0:?}")]
    Serial(E),

    #[error("transport closed")]
    TransportClosed,

    #[error("{step}: sent {sent} of {expected} bytes")]
    SendLengthMismatch { step: Step, expected: usize, sent: usize },

    #[error("{step}: echo does not match transmitted bytes")]
    EchoMismatch { step: Step },

    #[error("{step}: response timeout, received {received} of {expected} bytes")]
    ResponseTimeout { step: Step, expected: usize, received: usize },

    #[error("{step}: unexpected NACK")]
    Nack { step: Step },

    #[error("{step}: unexpected response 0x{value:02x}")]
    InvalidResponse { step: Step, value: u8 },

    #[error("no flash found at any known size boundary")]
    UnknownFlashSize,

    #[error("unsupported device ({0})")]
    UnsupportedDevice(DeviceDescriptor),

    #[error("{op}: {len} bytes at 0x{address:08x} out of range")]
    AddressOutOfRange { op: Operation, address: u32, len: usize },

    #[error("verify failed at 0x{address:04x} (expected 0x{expected:02x}, read 0x{found:02x})")]
    VerifyFailed { address: u32, expected: u8, found: u8 },

    #[error("cannot load routines {name}: {reason}")]
    RoutinesUnavailable { name: &'static str, reason: String },

    #[error("{name}: {source}")]
    Hex { name: String, source: HexError },
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Reset the device via DTR/RTS before connecting
    #[cfg_attr(feature = "structopt", structopt(long))]
    pub reset: bool,

    /// Single-wire reply mode (e.g. LIN), discards the echo of every transmitted byte
    #[cfg_attr(feature = "structopt", structopt(long = "reply", short = "r"))]
    pub reply_mode: bool,

    /// Timeout to wait for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1000"))]
    pub response_timeout_ms: u32,

    /// Period to poll for bootloader responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1"))]
    pub poll_delay_ms: u32,

    /// Period to wait for bootloader init before sending sync character
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "50"))]
    pub init_delay_ms: u32,

    /// Number of sync characters to send before giving up
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "10"))]
    pub sync_attempts: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            reset: false,
            reply_mode: false,
            response_timeout_ms: 1000,
            poll_delay_ms: 1,
            init_delay_ms: 50,
            sync_attempts: 10,
        }
    }
}

impl Options {
    pub fn link_mode(&self) -> LinkMode {
        if self.reply_mode {
            LinkMode::SingleWire
        } else {
            LinkMode::Uart
        }
    }
}

/// Acknowledgement received for an exchange
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum Reply {
    Ack,
    Nack,
}

/// Responses an exchange accepts as success
#[derive(Copy, Clone, PartialEq, Debug)]
enum Accept {
    Ack,
    AckOrNack,
}

pub struct Programmer<P, D, E> {
    state: State,
    options: Options,
    port: Option<P>,
    delay: D,
    _err: PhantomData<E>,
}

impl<P, D, E> Programmer<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: fmt::Debug,
{
    /// Create a new programmer instance
    pub fn new(port: P, delay: D, options: Options) -> Self {
        Self { state: State::Idle, options, port: Some(port), delay, _err: PhantomData }
    }

    /// Fetch the programmer state
    pub fn state(&self) -> State {
        self.state
    }

    pub fn options(&self) -> &Options {
        &self.options
    }

    /// Release the serial port, later operations fail with [`Error::TransportClosed`]
    pub fn close(&mut self) -> Option<P> {
        debug!("Closing port");
        self.port.take()
    }

    /// Optionally reset the device, then synchronise with the bootloader
    pub fn init(&mut self) -> Result<Reply, Error<E>> {
        if self.options.reset {
            debug!("Resetting device");

            let port = self.port.as_mut().ok_or(Error::TransportClosed)?;

            port.set_dtr(true).map_err(Error::Serial)?;
            port.set_rts(true).map_err(Error::Serial)?;

            self.delay.delay_ms(100u32);

            port.set_dtr(false).map_err(Error::Serial)?;
            port.set_rts(false).map_err(Error::Serial)?;

            self.delay.delay_ms(self.options.init_delay_ms);
        }

        self.sync()
    }

    /// Send a frame and await its response.
    ///
    /// In single-wire mode the echo of `tx` is read back and compared first.
    /// `rx[0]` must be an acceptable acknowledgement, and `rx` must fill
    /// completely before the response timeout.
    fn exchange(
        &mut self,
        step: Step,
        tx: &[u8],
        rx: &mut [u8],
        accept: Accept,
    ) -> Result<Reply, Error<E>> {
        trace!("{}: tx {:02x?}", step, tx);

        let sent = self.send(tx)?;
        if sent != tx.len() {
            return Err(Error::SendLengthMismatch { step, expected: tx.len(), sent });
        }

        if self.options.link_mode() == LinkMode::SingleWire {
            self.consume_echo(step, tx)?;
        }

        let received = self.receive(rx)?;
        if received == 0 {
            return Err(Error::ResponseTimeout { step, expected: rx.len(), received });
        }

        let reply = match rx[0] {
            ACK => Reply::Ack,
            NACK if accept == Accept::AckOrNack => Reply::Nack,
            NACK => return Err(Error::Nack { step }),
            value => return Err(Error::InvalidResponse { step, value }),
        };

        if received != rx.len() {
            return Err(Error::ResponseTimeout { step, expected: rx.len(), received });
        }

        trace!("{}: rx {:02x?}", step, rx);

        Ok(reply)
    }

    fn consume_echo(&mut self, step: Step, tx: &[u8]) -> Result<(), Error<E>> {
        debug_assert!(tx.len() <= MAX_FRAME);

        let mut echo = [0u8; MAX_FRAME];
        let echo = &mut echo[..tx.len()];

        let received = self.receive(echo)?;
        if received != tx.len() {
            return Err(Error::ResponseTimeout { step, expected: tx.len(), received });
        }
        if &echo[..] != tx {
            return Err(Error::EchoMismatch { step });
        }
        Ok(())
    }

    /// Write `data`, returning the number of bytes the port accepted in time.
    ///
    /// The timeout is measured both in poll periods and in wall time, ports
    /// may block inside `write` before reporting `WouldBlock`.
    fn send(&mut self, data: &[u8]) -> Result<usize, Error<E>> {
        let port = self.port.as_mut().ok_or(Error::TransportClosed)?;
        let poll = self.options.poll_delay_ms.max(1);
        let timeout = Duration::from_millis(self.options.response_timeout_ms as u64);
        let start = Instant::now();
        let mut waited = 0;

        for (sent, b) in data.iter().enumerate() {
            loop {
                match port.write(*b) {
                    Ok(()) => break,
                    Err(nb::Error::WouldBlock) => (),
                    Err(nb::Error::Other(e)) => return Err(Error::Serial(e)),
                }

                if waited >= self.options.response_timeout_ms || start.elapsed() >= timeout {
                    warn!("Send timeout after {} of {} bytes", sent, data.len());
                    return Ok(sent);
                }
                self.delay.delay_ms(poll);
                waited += poll;
            }
        }

        block!(port.flush()).map_err(Error::Serial)?;

        Ok(data.len())
    }

    /// Read up to `buf.len()` bytes, stopping once no byte has arrived for the
    /// response timeout. Returns the number of bytes read.
    fn receive(&mut self, buf: &mut [u8]) -> Result<usize, Error<E>> {
        let port = self.port.as_mut().ok_or(Error::TransportClosed)?;
        let poll = self.options.poll_delay_ms.max(1);
        let timeout = Duration::from_millis(self.options.response_timeout_ms as u64);
        let mut last = Instant::now();
        let mut idle = 0;
        let mut n = 0;

        while n < buf.len() {
            match port.read() {
                Ok(v) => {
                    buf[n] = v;
                    n += 1;
                    idle = 0;
                    last = Instant::now();
                    continue;
                }
                Err(nb::Error::WouldBlock) => (),
                Err(nb::Error::Other(e)) => return Err(Error::Serial(e)),
            }

            if idle >= self.options.response_timeout_ms || last.elapsed() >= timeout {
                debug!("Receive timeout after {} of {} bytes", n, buf.len());
                break;
            }
            self.delay.delay_ms(poll);
            idle += poll;
        }

        Ok(n)
    }

    /// Discard anything already waiting in the receive buffer
    fn flush_input(&mut self) -> Result<(), Error<E>> {
        let port = self.port.as_mut().ok_or(Error::TransportClosed)?;
        let mut discarded = 0;

        loop {
            match port.read() {
                Ok(_) => discarded += 1,
                Err(nb::Error::WouldBlock) => break,
                Err(nb::Error::Other(e)) => return Err(Error::Serial(e)),
            }
        }

        if discarded > 0 {
            debug!("Discarded {} stale bytes", discarded);
        }
        Ok(())
    }
}
