//! Full upload sequence: sync, identify, helper routines, user image, finalize

use std::fs;
use std::io;
use std::path::Path;

use core::fmt;

use embedded_hal::blocking::delay::DelayMs;

use crate::catalog::{self, DeviceDescriptor, RoutineSource};
use crate::hexfile::{self, Format, HexError, MemoryImage};
use crate::protocol::{BSL_ACTIVATION, FLASH_BASE, OPT_BSL_ADDRESS, SECTOR_SIZE};
use crate::{Error, Programmer, SerialPort, State};

/// A user image in S19 or Intel-HEX text, tagged with the name that selects its format
#[derive(Clone, PartialEq, Debug)]
pub struct Firmware {
    name: String,
    text: String,
}

impl Firmware {
    pub fn new<N: Into<String>, T: Into<String>>(name: N, text: T) -> Self {
        Self { name: name.into(), text: text.into() }
    }

    /// Read a firmware file from disk
    pub fn load<P: AsRef<Path>>(path: P) -> io::Result<Self> {
        let path = path.as_ref();
        let text = fs::read_to_string(path)?;
        Ok(Self::new(path.display().to_string(), text))
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Decode using the format implied by the file extension
    pub fn decode(&self) -> Result<MemoryImage, HexError> {
        let format = Format::from_path(&self.name)?;
        debug!("Decoding {} as {}", self.name, format);
        hexfile::decode(&self.text, format)
    }
}

/// What [`Programmer::run`] should do once the helper routines are in place
#[derive(Clone, PartialEq, Debug)]
pub struct UploadPlan {
    pub firmware: Option<Firmware>,
    /// Erase the flash sectors covered by the image before writing it
    pub erase: bool,
    /// Read the image back after writing it
    pub verify: bool,
    /// Write the option bytes that keep the ROM bootloader enabled
    pub enable_bsl: bool,
    /// Jump to the start of flash when done
    pub jump: bool,
}

impl Default for UploadPlan {
    fn default() -> Self {
        Self { firmware: None, erase: false, verify: false, enable_bsl: true, jump: true }
    }
}

/// Transfer progress, reported after every window
#[derive(Copy, Clone, PartialEq, Debug)]
pub struct Progress {
    pub phase: State,
    pub complete: usize,
    pub total: usize,
}

impl<P, D, E> Programmer<P, D, E>
where
    P: SerialPort<E>,
    D: DelayMs<u32>,
    E: fmt::Debug,
{
    /// Run the upload sequence, returning the identified device.
    ///
    /// Any failure aborts the remaining steps and leaves the programmer in
    /// [`State::Failed`]. Flash already written is not rolled back.
    pub fn run<R, F>(
        &mut self,
        plan: &UploadPlan,
        routines: &R,
        mut progress: F,
    ) -> Result<DeviceDescriptor, Error<E>>
    where
        R: RoutineSource + ?Sized,
        F: FnMut(Progress),
    {
        match self.sequence(plan, routines, &mut progress) {
            Ok(device) => {
                self.state = State::Done;
                info!("Upload complete");
                Ok(device)
            }
            Err(e) => {
                error!("Upload failed in {:?} state: {}", self.state, e);
                self.state = State::Failed;
                Err(e)
            }
        }
    }

    fn sequence<R, F>(
        &mut self,
        plan: &UploadPlan,
        routines: &R,
        progress: &mut F,
    ) -> Result<DeviceDescriptor, Error<E>>
    where
        R: RoutineSource + ?Sized,
        F: FnMut(Progress),
    {
        self.state = State::Syncing;
        self.init()?;

        self.state = State::Identifying;
        let device = self.get_info()?;
        let entry = catalog::lookup(&device).ok_or(Error::UnsupportedDevice(device))?;

        self.state = State::HelperUpload;
        let text = routines.load(entry).map_err(|e| Error::RoutinesUnavailable {
            name: entry.name,
            reason: e.to_string(),
        })?;
        let helper = hexfile::decode(&text, Format::S19)
            .map_err(|source| Error::Hex { name: entry.name.to_string(), source })?;

        info!("Uploading {} ({} bytes at 0x{:04x})", entry.name, helper.len(), helper.base_address());
        self.write_mem_with(helper.base_address(), helper.data(), &mut *progress)?;

        if let Some(firmware) = &plan.firmware {
            self.state = State::ImageUpload;
            let image = firmware
                .decode()
                .map_err(|source| Error::Hex { name: firmware.name.clone(), source })?;

            if plan.erase {
                self.erase_image(&image)?;
            }

            info!("Uploading {} ({} bytes at 0x{:04x})", firmware.name, image.len(), image.base_address());
            self.write_mem_with(image.base_address(), image.data(), &mut *progress)?;

            if plan.verify {
                self.verify(&image, &mut *progress)?;
            }
        }

        self.state = State::Finalizing;
        if plan.enable_bsl {
            info!("Enabling ROM bootloader");
            self.write_mem(OPT_BSL_ADDRESS, &BSL_ACTIVATION)?;
        }
        if plan.jump {
            self.go(FLASH_BASE)?;
        }

        Ok(device)
    }

    /// Erase every flash sector the image touches, skipping anything below flash
    fn erase_image(&mut self, image: &MemoryImage) -> Result<(), Error<E>> {
        let end = match image.end_address() {
            Some(end) if end >= FLASH_BASE => end,
            _ => {
                warn!("Image does not reach flash, nothing to erase");
                return Ok(());
            }
        };
        let start = image.base_address().max(FLASH_BASE);

        let first = (start - FLASH_BASE) / SECTOR_SIZE;
        let last = (end - FLASH_BASE) / SECTOR_SIZE;
        info!("Erasing sectors {} to {}", first, last);

        for sector in first..=last {
            self.erase_sector(FLASH_BASE + sector * SECTOR_SIZE)?;
        }

        Ok(())
    }

    fn verify<F>(&mut self, image: &MemoryImage, progress: F) -> Result<(), Error<E>>
    where
        F: FnMut(Progress),
    {
        info!("Verifying {} bytes", image.len());

        let base = image.base_address();
        let found = self.read_mem_with(base, image.len(), progress)?;

        let mismatch = image
            .data()
            .iter()
            .zip(&found)
            .position(|(a, b)| a != b);

        match mismatch {
            Some(i) => Err(Error::VerifyFailed {
                address: base + i as u32,
                expected: image.data()[i],
                found: found[i],
            }),
            None => Ok(()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::{FlashSize, RoutineEntry};
    use crate::sim::{self, Bsl};
    use crate::Options;

    const ROUTINES: &str = "S00600004844521B\nS10500A09D813C\nS9030000FC\n";
    const IMAGE: &str = "S1059000AABB05\r\nS1059010CCDDB1\r\nS90390006C\r\n";

    fn routines(_: &RoutineEntry) -> io::Result<String> {
        Ok(ROUTINES.to_string())
    }

    fn plan() -> UploadPlan {
        UploadPlan { firmware: Some(Firmware::new("app.s19", IMAGE)), ..UploadPlan::default() }
    }

    fn image_bytes() -> Vec<u8> {
        let mut data = vec![0u8; 0x12];
        data[..2].copy_from_slice(&[0xAA, 0xBB]);
        data[0x10..].copy_from_slice(&[0xCC, 0xDD]);
        data
    }

    #[test]
    fn full_upload() {
        let mut p = sim::programmer(Bsl::new(FlashSize::K32, 0x13), Options::default());
        let mut phases = vec![];

        let device = p.run(&plan(), &routines, |r| phases.push(r.phase)).unwrap();
        assert_eq!(device, DeviceDescriptor { flash: FlashSize::K32, version: 0x13 });
        assert_eq!(p.state(), State::Done);
        assert_eq!(phases, vec![State::HelperUpload, State::ImageUpload]);

        let bsl = p.close().unwrap();
        assert_eq!(
            bsl.writes,
            vec![
                (0x00A0, vec![0x9D, 0x81]),
                (0x9000, image_bytes()),
                (OPT_BSL_ADDRESS, BSL_ACTIVATION.to_vec()),
            ]
        );
        assert!(bsl.erased.is_empty());
        assert_eq!(bsl.jumped, Some(FLASH_BASE));
    }

    #[test]
    fn unsupported_device_writes_nothing() {
        let mut p = sim::programmer(Bsl::new(FlashSize::K128, 0x99), Options::default());

        assert_eq!(
            p.run(&plan(), &routines, |_| ()),
            Err(Error::UnsupportedDevice(DeviceDescriptor { flash: FlashSize::K128, version: 0x99 }))
        );
        assert_eq!(p.state(), State::Failed);

        let bsl = p.close().unwrap();
        assert!(bsl.writes.is_empty());
        assert_eq!(bsl.jumped, None);
    }

    #[test]
    fn unknown_extension_fails_after_helper_upload() {
        let plan = UploadPlan { firmware: Some(Firmware::new("app.bin", IMAGE)), ..plan() };
        let mut p = sim::programmer(Bsl::new(FlashSize::K32, 0x13), Options::default());

        assert_eq!(
            p.run(&plan, &routines, |_| ()),
            Err(Error::Hex {
                name: "app.bin".to_string(),
                source: HexError::UnsupportedFileFormat("app.bin".to_string())
            })
        );

        let bsl = p.close().unwrap();
        assert_eq!(bsl.writes, vec![(0x00A0, vec![0x9D, 0x81])]);
    }

    #[test]
    fn bad_image_checksum_aborts() {
        let text = "S1059000AABB05\nS1059010CCDDB2\n";
        let plan = UploadPlan { firmware: Some(Firmware::new("app.S19", text)), ..plan() };
        let mut p = sim::programmer(Bsl::new(FlashSize::K32, 0x13), Options::default());

        match p.run(&plan, &routines, |_| ()) {
            Err(Error::Hex { source: HexError::ChecksumMismatch { line: 2, .. }, .. }) => (),
            other => panic!("unexpected {:?}", other),
        }
        assert_eq!(p.close().unwrap().jumped, None);
    }

    #[test]
    fn erase_and_verify() {
        let mut bsl = Bsl::new(FlashSize::K32, 0x13);
        bsl.load(0x9100, &[0x11, 0x22]);
        bsl.load(0x9400, &[0x33]);

        let plan = UploadPlan { erase: true, verify: true, ..plan() };
        let mut p = sim::programmer(bsl, Options::default());
        p.run(&plan, &routines, |_| ()).unwrap();

        let bsl = p.close().unwrap();
        assert_eq!(bsl.erased, vec![4]);
        assert_eq!(bsl.dump(0x9100, 2), vec![0, 0]);
        assert_eq!(bsl.dump(0x9400, 1), vec![0x33]);
        assert_eq!(bsl.reads.last(), Some(&(0x9000, 0x12)));
    }

    #[test]
    fn verify_reports_first_difference() {
        let mut bsl = Bsl::new(FlashSize::K32, 0x13);
        bsl.corrupt = Some(0x9011);

        let plan = UploadPlan { verify: true, ..plan() };
        let mut p = sim::programmer(bsl, Options::default());

        assert_eq!(
            p.run(&plan, &routines, |_| ()),
            Err(Error::VerifyFailed { address: 0x9011, expected: 0xDD, found: 0x22 })
        );
        assert_eq!(p.state(), State::Failed);
        assert_eq!(p.close().unwrap().jumped, None);
    }

    #[test]
    fn missing_routines() {
        let missing = |_: &RoutineEntry| -> io::Result<String> {
            Err(io::Error::new(io::ErrorKind::NotFound, "gone"))
        };
        let mut p = sim::programmer(Bsl::new(FlashSize::K32, 0x13), Options::default());

        assert_eq!(
            p.run(&plan(), &missing, |_| ()),
            Err(Error::RoutinesUnavailable {
                name: "E_W_ROUTINEs_32K_ver_1.3.s19",
                reason: "gone".to_string()
            })
        );
        assert!(p.close().unwrap().writes.is_empty());
    }

    #[test]
    fn upload_over_single_wire() {
        let mut bsl = Bsl::new(FlashSize::K128, 0x22);
        bsl.echo = true;
        let options = Options { reply_mode: true, ..Options::default() };

        let plan = UploadPlan { verify: true, ..plan() };
        let mut p = sim::programmer(bsl, options);
        p.run(&plan, &routines, |_| ()).unwrap();

        let bsl = p.close().unwrap();
        assert_eq!(bsl.dump(0x9000, 0x12), image_bytes());
        assert_eq!(bsl.jumped, Some(FLASH_BASE));
    }

    #[test]
    fn routines_only() {
        let plan = UploadPlan { enable_bsl: false, jump: false, ..UploadPlan::default() };
        let source: &dyn RoutineSource = &routines;
        let mut p = sim::programmer(Bsl::new(FlashSize::K256, 0x10), Options::default());

        p.run(&plan, source, |_| ()).unwrap();

        let bsl = p.close().unwrap();
        assert_eq!(bsl.writes, vec![(0x00A0, vec![0x9D, 0x81])]);
        assert_eq!(bsl.jumped, None);
    }

    #[test]
    fn firmware_from_disk() {
        let path = std::env::temp_dir().join("stm8-uart-loader-firmware-test.hex");
        fs::write(&path, ":020000040001F9\n:02001000AABB89\n:00000001FF\n").unwrap();

        let firmware = Firmware::load(&path).unwrap();
        let image = firmware.decode().unwrap();
        assert_eq!(image.base_address(), 0x0001_0010);
        assert_eq!(image.data(), &[0xAA, 0xBB]);

        let _ = fs::remove_file(&path);
    }
}
