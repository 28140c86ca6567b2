//! Simulated STM8 ROM bootloader for tests.
//!
//! Decodes the host's byte stream frame by frame, checks every checksum and
//! answers the way the ROM does. Transfers are logged for inspection.

use std::collections::{HashMap, VecDeque};
use std::thread;
use std::time::Duration;

use embedded_hal::blocking::delay::DelayMs;
use embedded_hal::serial::{Read, Write};

use crate::catalog::FlashSize;
use crate::checksum::{block_checksum, frame_valid};
use crate::protocol::*;
use crate::{Options, Programmer, SerialPort};

#[derive(Clone, PartialEq, Debug)]
pub struct SimError;

pub struct NoDelay;

impl DelayMs<u32> for NoDelay {
    fn delay_ms(&mut self, _ms: u32) {}
}

#[derive(Copy, Clone, PartialEq, Debug)]
enum Expect {
    Command,
    Address(Command),
    Count(u32),
    Data(u32),
    Sectors,
}

pub struct Bsl {
    pub flash: Option<FlashSize>,
    pub get_response: [u8; GET_RESPONSE_LEN],
    pub echo: bool,
    pub synced: bool,
    pub mute: bool,
    /// Sync characters to ignore before answering
    pub ignore_syncs: usize,
    pub nack_writes_at: Option<u32>,
    /// Address whose written value is stored inverted
    pub corrupt: Option<u32>,
    /// Echo every byte with its low bit flipped
    pub corrupt_echo: bool,
    /// Refuse every transmitted byte
    pub write_blocked: bool,
    /// Time an empty read blocks before reporting `WouldBlock`
    pub read_stall: Option<Duration>,

    pub to_host: VecDeque<u8>,
    pub syncs: usize,
    pub reads: Vec<(u32, usize)>,
    pub writes: Vec<(u32, Vec<u8>)>,
    pub erased: Vec<u8>,
    pub nacked_addresses: Vec<u32>,
    pub jumped: Option<u32>,
    pub lines: Vec<(&'static str, bool)>,

    mem: HashMap<u32, u8>,
    frame: Vec<u8>,
    expect: Expect,
}

impl Bsl {
    pub fn new(flash: FlashSize, version: u8) -> Self {
        Self {
            flash: Some(flash),
            get_response: [ACK, 5, version, 0x00, 0x11, 0x21, 0x31, 0x43, ACK],
            echo: false,
            synced: false,
            mute: false,
            ignore_syncs: 0,
            nack_writes_at: None,
            corrupt: None,
            corrupt_echo: false,
            write_blocked: false,
            read_stall: None,
            to_host: VecDeque::new(),
            syncs: 0,
            reads: vec![],
            writes: vec![],
            erased: vec![],
            nacked_addresses: vec![],
            jumped: None,
            lines: vec![],
            mem: HashMap::new(),
            frame: vec![],
            expect: Expect::Command,
        }
    }

    pub fn load(&mut self, address: u32, data: &[u8]) {
        for (i, b) in data.iter().enumerate() {
            self.mem.insert(address + i as u32, *b);
        }
    }

    pub fn dump(&self, address: u32, len: usize) -> Vec<u8> {
        (0..len as u32)
            .map(|i| self.mem.get(&(address + i)).copied().unwrap_or(0))
            .collect()
    }

    /// RAM, EEPROM with option bytes, and flash
    fn mapped(&self, address: u32, len: usize) -> bool {
        let end = address as u64 + len as u64;
        let within = |start: u32, stop: u32| address >= start && end <= stop as u64;

        within(0x0000, 0x1800)
            || within(0x4000, 0x4900)
            || self.flash.map_or(false, |f| within(FLASH_BASE, f.last_address() + 1))
    }

    fn reply(&mut self, bytes: &[u8]) {
        self.to_host.extend(bytes);
    }

    fn ack(&mut self, next: Expect) {
        self.reply(&[ACK]);
        self.expect = next;
    }

    fn nack(&mut self) {
        self.reply(&[NACK]);
        self.expect = Expect::Command;
    }

    fn receive(&mut self, b: u8) {
        if self.echo {
            self.to_host.push_back(if self.corrupt_echo { b ^ 0x01 } else { b });
        }
        if self.mute {
            return;
        }

        if !self.synced || (self.expect == Expect::Command && self.frame.is_empty() && b == SYNCH) {
            if b == SYNCH {
                self.syncs += 1;
                if self.ignore_syncs > 0 {
                    self.ignore_syncs -= 1;
                } else {
                    self.reply(&[if self.synced { NACK } else { ACK }]);
                    self.synced = true;
                }
            }
            return;
        }

        self.frame.push(b);
        if self.frame.len() < self.frame_len() {
            return;
        }

        let frame = std::mem::take(&mut self.frame);
        self.handle(&frame);
    }

    /// Length of the frame currently being received
    fn frame_len(&self) -> usize {
        match self.expect {
            Expect::Command | Expect::Count(_) => 2,
            Expect::Address(_) => 5,
            Expect::Data(_) => self.frame[0] as usize + 3,
            Expect::Sectors => 3,
        }
    }

    fn handle(&mut self, frame: &[u8]) {
        match self.expect {
            Expect::Command => {
                if !frame_valid(frame[0], frame[1]) {
                    return self.nack();
                }
                match frame[0] {
                    0x00 => {
                        let response = self.get_response;
                        self.reply(&response);
                    }
                    0x11 => self.ack(Expect::Address(Command::ReadMemory)),
                    0x21 => self.ack(Expect::Address(Command::Go)),
                    0x31 => self.ack(Expect::Address(Command::WriteMemory)),
                    0x43 => self.ack(Expect::Sectors),
                    _ => self.nack(),
                }
            }
            Expect::Address(command) => {
                let address = u32::from_be_bytes([frame[0], frame[1], frame[2], frame[3]]);
                if frame[4] != block_checksum(&frame[..4]) || !self.mapped(address, 1) {
                    self.nacked_addresses.push(address);
                    return self.nack();
                }
                match command {
                    Command::ReadMemory => self.ack(Expect::Count(address)),
                    Command::WriteMemory => self.ack(Expect::Data(address)),
                    _ => {
                        self.jumped = Some(address);
                        self.ack(Expect::Command);
                    }
                }
            }
            Expect::Count(address) => {
                let len = frame[0] as usize + 1;
                if !frame_valid(frame[0], frame[1]) || !self.mapped(address, len) {
                    return self.nack();
                }
                self.reads.push((address, len));
                let data = self.dump(address, len);
                self.ack(Expect::Command);
                self.reply(&data);
            }
            Expect::Data(address) => {
                let (chk, body) = match frame.split_last() {
                    Some(split) => split,
                    None => return self.nack(),
                };
                let data = &body[1..];
                if *chk != block_checksum(body)
                    || !self.mapped(address, data.len())
                    || self.nack_writes_at == Some(address)
                {
                    return self.nack();
                }
                self.load(address, data);
                let window = address..address + data.len() as u32;
                if let Some(a) = self.corrupt.filter(|a| window.contains(a)) {
                    if let Some(b) = self.mem.get_mut(&a) {
                        *b ^= 0xFF;
                    }
                }
                self.writes.push((address, data.to_vec()));
                self.ack(Expect::Command);
            }
            Expect::Sectors => {
                if frame[0] != 0x00 || frame[2] != block_checksum(&frame[..2]) {
                    return self.nack();
                }
                let start = FLASH_BASE + frame[1] as u32 * SECTOR_SIZE;
                self.mem.retain(|a, _| *a < start || *a >= start + SECTOR_SIZE);
                self.erased.push(frame[1]);
                self.ack(Expect::Command);
            }
        }
    }
}

impl Write<u8> for Bsl {
    type Error = SimError;

    fn write(&mut self, word: u8) -> nb::Result<(), SimError> {
        if self.write_blocked {
            return Err(nb::Error::WouldBlock);
        }
        self.receive(word);
        Ok(())
    }

    fn flush(&mut self) -> nb::Result<(), SimError> {
        Ok(())
    }
}

impl Read<u8> for Bsl {
    type Error = SimError;

    fn read(&mut self) -> nb::Result<u8, SimError> {
        match self.to_host.pop_front() {
            Some(b) => Ok(b),
            None => {
                if let Some(stall) = self.read_stall {
                    thread::sleep(stall);
                }
                Err(nb::Error::WouldBlock)
            }
        }
    }
}

impl SerialPort<SimError> for Bsl {
    fn set_rts(&mut self, level: bool) -> Result<(), SimError> {
        self.lines.push(("rts", level));
        Ok(())
    }

    fn set_dtr(&mut self, level: bool) -> Result<(), SimError> {
        self.lines.push(("dtr", level));
        Ok(())
    }
}

pub fn programmer(bsl: Bsl, options: Options) -> Programmer<Bsl, NoDelay, SimError> {
    Programmer::new(bsl, NoDelay, options)
}

/// Programmer attached to a bootloader that has already seen the sync character
pub fn synced(mut bsl: Bsl, options: Options) -> Programmer<Bsl, NoDelay, SimError> {
    bsl.synced = true;
    programmer(bsl, options)
}
