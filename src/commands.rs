//! Bootloader commands

use core::fmt;

use embedded_hal::blocking::delay::DelayMs;

use crate::catalog::{DeviceDescriptor, FlashSize};
use crate::checksum::{block_checksum, frame_checksum};
use crate::protocol::*;
use crate::{Accept, Error, Frame, Operation, Programmer, Progress, Reply, SerialPort, Step};

/// Pause between synchronisation attempts
const SYNC_RETRY_DELAY_MS: u32 = 10;

impl<P, D, E> Programmer<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: fmt::Debug,
{
    /// Synchronise with the bootloader.
    ///
    /// Returns [`Reply::Nack`] if the bootloader was already synchronised.
    pub fn sync(&mut self) -> Result<Reply, Error<E>> {
        self.flush_input()?;

        let step = Step::new(Operation::Sync, Frame::Command);
        let attempts = self.options.sync_attempts.max(1);
        let mut rx = [0u8; 1];
        let mut attempt = 1;

        loop {
            debug!("Sending sync character ({}/{})", attempt, attempts);

            match self.exchange(step, &[SYNCH], &mut rx, Accept::AckOrNack) {
                Ok(Reply::Ack) => {
                    debug!("Received bootloader ack");
                    return Ok(Reply::Ack);
                }
                Ok(Reply::Nack) => {
                    debug!("Received bootloader nack, already synchronised");
                    return Ok(Reply::Nack);
                }
                Err(e @ Error::ResponseTimeout { .. }) | Err(e @ Error::InvalidResponse { .. })
                    if attempt < attempts =>
                {
                    warn!("Sync attempt {} failed: {}", attempt, e);
                }
                Err(e) => return Err(e),
            }

            attempt += 1;
            self.delay.delay_ms(SYNC_RETRY_DELAY_MS);
        }
    }

    /// Identify the device by probing its flash size and querying the bootloader version
    pub fn get_info(&mut self) -> Result<DeviceDescriptor, Error<E>> {
        self.flush_input()?;

        let flash = self.probe_flash()?;
        let version = self.get_version()?;

        let device = DeviceDescriptor { flash, version };
        info!("Found device: {}", device);

        Ok(device)
    }

    /// Read the last byte of each known flash size, largest first.
    /// The first readable one is the flash size of the device.
    fn probe_flash(&mut self) -> Result<FlashSize, Error<E>> {
        for size in FlashSize::PROBE_ORDER.iter() {
            let address = size.last_address();

            match self.read_mem(address, 1) {
                Ok(_) => {
                    debug!("Flash ends at 0x{:06x}", address);
                    return Ok(*size);
                }
                Err(e) if absent(&e) => {
                    debug!("No {}kB flash: {}", size.kb(), e);
                    self.flush_input()?;
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::UnknownFlashSize)
    }

    /// GET returns `[ACK, N, version, GET, READ, GO, WRITE, ERASE, ACK]`
    fn get_version(&mut self) -> Result<u8, Error<E>> {
        let step = Step::new(Operation::GetInfo, Frame::Command);
        let cmd = Command::Get.code();
        let mut rx = [0u8; GET_RESPONSE_LEN];

        self.exchange(step, &[cmd, frame_checksum(cmd)], &mut rx, Accept::Ack)?;

        let last = rx[GET_RESPONSE_LEN - 1];
        if last != ACK {
            return Err(Error::InvalidResponse { step, value: last });
        }

        for (expected, found) in Command::SUPPORTED.iter().zip(&rx[3..8]) {
            if expected.code() != *found {
                error!("Bootloader reports {:?} as 0x{:02x}", expected, found);
                return Err(Error::InvalidResponse { step, value: *found });
            }
        }

        Ok(rx[2])
    }

    /// Read `count` bytes starting at `address`
    pub fn read_mem(&mut self, address: u32, count: usize) -> Result<Vec<u8>, Error<E>> {
        self.read_mem_with(address, count, |_| ())
    }

    /// Read `count` bytes starting at `address`, reporting progress after each window
    pub fn read_mem_with<F>(
        &mut self,
        address: u32,
        count: usize,
        mut progress: F,
    ) -> Result<Vec<u8>, Error<E>>
    where
        F: FnMut(Progress),
    {
        if !range_fits(address, count) {
            return Err(Error::AddressOutOfRange { op: Operation::Read(address), address, len: count });
        }

        let mut data = Vec::with_capacity(count);
        let mut buf = [0u8; READ_CHUNK + 1];

        for w in windows(address, count, READ_CHUNK) {
            let op = Operation::Read(w.address);

            self.command(op, Command::ReadMemory)?;
            self.address(op, w.address)?;

            // ACK and data arrive as one response
            let n = (w.len - 1) as u8;
            let rx = &mut buf[..w.len + 1];
            self.exchange(Step::new(op, Frame::Data), &[n, frame_checksum(n)], rx, Accept::Ack)?;

            data.extend_from_slice(&rx[1..]);
            progress(Progress { phase: self.state, complete: data.len(), total: count });
        }

        Ok(data)
    }

    /// Write `data` starting at `address`
    pub fn write_mem(&mut self, address: u32, data: &[u8]) -> Result<(), Error<E>> {
        self.write_mem_with(address, data, |_| ())
    }

    /// Write `data` starting at `address`, reporting progress after each window
    pub fn write_mem_with<F>(&mut self, address: u32, data: &[u8], mut progress: F) -> Result<(), Error<E>>
    where
        F: FnMut(Progress),
    {
        if !range_fits(address, data.len()) {
            return Err(Error::AddressOutOfRange {
                op: Operation::Write(address),
                address,
                len: data.len(),
            });
        }

        let mut frame = [0u8; MAX_FRAME];

        for w in windows(address, data.len(), WRITE_CHUNK) {
            let op = Operation::Write(w.address);

            self.command(op, Command::WriteMemory)?;
            self.address(op, w.address)?;

            // count, data, checksum over both
            frame[0] = (w.len - 1) as u8;
            frame[1..=w.len].copy_from_slice(&data[w.offset..w.offset + w.len]);
            frame[w.len + 1] = block_checksum(&frame[..=w.len]);

            self.exchange(Step::new(op, Frame::Data), &frame[..w.len + 2], &mut [0u8; 1], Accept::Ack)?;

            progress(Progress { phase: self.state, complete: w.offset + w.len, total: data.len() });
        }

        Ok(())
    }

    /// Erase the 1 kB flash sector containing `address`
    pub fn erase_sector(&mut self, address: u32) -> Result<(), Error<E>> {
        let op = Operation::Erase(address);

        let sector = address
            .checked_sub(FLASH_BASE)
            .map(|offset| offset / SECTOR_SIZE)
            .filter(|s| *s <= 0xFF)
            .ok_or(Error::AddressOutOfRange { op, address, len: 1 })? as u8;

        debug!("Erasing sector {} (0x{:04x})", sector, address);

        self.command(op, Command::Erase)?;

        // one sector (N-1 = 0), sector code, checksum
        let frame = [0x00, sector, block_checksum(&[0x00, sector])];
        self.exchange(Step::new(op, Frame::Sector), &frame, &mut [0u8; 1], Accept::Ack)?;

        Ok(())
    }

    /// Leave the bootloader and execute code at `address`
    pub fn go(&mut self, address: u32) -> Result<(), Error<E>> {
        let op = Operation::Go(address);

        info!("Jumping to 0x{:04x}", address);

        self.command(op, Command::Go)?;
        self.address(op, address)
    }

    fn command(&mut self, op: Operation, command: Command) -> Result<(), Error<E>> {
        let c = command.code();
        self.exchange(Step::new(op, Frame::Command), &[c, frame_checksum(c)], &mut [0u8; 1], Accept::Ack)?;
        Ok(())
    }

    fn address(&mut self, op: Operation, address: u32) -> Result<(), Error<E>> {
        let mut frame = [0u8; 5];
        frame[..4].copy_from_slice(&address.to_be_bytes());
        frame[4] = block_checksum(&frame[..4]);

        self.exchange(Step::new(op, Frame::Address), &frame, &mut [0u8; 1], Accept::Ack)?;
        Ok(())
    }
}

/// Failures that mean the bootloader refused or ignored a probe
fn absent<E: fmt::Debug>(e: &Error<E>) -> bool {
    match e {
        Error::ResponseTimeout { .. } | Error::Nack { .. } | Error::InvalidResponse { .. } => true,
        _ => false,
    }
}
