//! Device identification and the flash write/erase routines each device needs
//!
//! The ROM bootloader cannot program flash by itself, ST ships RAM routines
//! (`E_W_ROUTINEs_*.s19`) that must be uploaded first. Which one depends on the
//! flash size and the bootloader version.

use std::fmt;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::protocol::FLASH_BASE;

#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub enum FlashSize {
    K8,
    K32,
    K128,
    K256,
}

impl FlashSize {
    /// Probe order, largest first
    pub const PROBE_ORDER: [FlashSize; 4] =
        [FlashSize::K256, FlashSize::K128, FlashSize::K32, FlashSize::K8];

    pub fn kb(self) -> u32 {
        match self {
            FlashSize::K8 => 8,
            FlashSize::K32 => 32,
            FlashSize::K128 => 128,
            FlashSize::K256 => 256,
        }
    }

    /// Highest flash address of a device this size, readable only if present
    pub fn last_address(self) -> u32 {
        FLASH_BASE + self.kb() * 1024 - 1
    }
}

/// Identity of the connected device, established once per session
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct DeviceDescriptor {
    pub flash: FlashSize,
    /// Bootloader version, major in the high nibble
    pub version: u8,
}

impl fmt::Display for DeviceDescriptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}kB flash, BSL v{:x}.{:x}",
            self.flash.kb(),
            self.version >> 4,
            self.version & 0x0F
        )
    }
}

/// A vendor routine payload identified by its file name
#[derive(Copy, Clone, PartialEq, Eq, Debug)]
pub struct RoutineEntry {
    pub flash: FlashSize,
    pub version: u8,
    pub name: &'static str,
}

macro_rules! entry {
    ($flash:ident, $version:expr, $name:expr) => {
        RoutineEntry { flash: FlashSize::$flash, version: $version, name: $name }
    };
}

/// Every supported device
pub static ROUTINES: [RoutineEntry; 9] = [
    entry!(K32, 0x10, "E_W_ROUTINEs_32K_ver_1.0.s19"),
    entry!(K32, 0x12, "E_W_ROUTINEs_32K_ver_1.2.s19"),
    entry!(K32, 0x13, "E_W_ROUTINEs_32K_ver_1.3.s19"),
    entry!(K32, 0x14, "E_W_ROUTINEs_32K_ver_1.4.s19"),
    entry!(K128, 0x20, "E_W_ROUTINEs_128K_ver_2.0.s19"),
    entry!(K128, 0x21, "E_W_ROUTINEs_128K_ver_2.1.s19"),
    entry!(K128, 0x22, "E_W_ROUTINEs_128K_ver_2.2.s19"),
    entry!(K128, 0x24, "E_W_ROUTINEs_128K_ver_2.4.s19"),
    entry!(K256, 0x10, "E_W_ROUTINEs_256K_ver_1.0.s19"),
];

/// Find the routines for a device, exact match on flash size and version
pub fn lookup(device: &DeviceDescriptor) -> Option<&'static RoutineEntry> {
    ROUTINES
        .iter()
        .find(|e| e.flash == device.flash && e.version == device.version)
}

/// Supplies the S19 text of a routine payload
pub trait RoutineSource {
    fn load(&self, entry: &RoutineEntry) -> io::Result<String>;
}

impl<F> RoutineSource for F
where
    F: Fn(&RoutineEntry) -> io::Result<String>,
{
    fn load(&self, entry: &RoutineEntry) -> io::Result<String> {
        self(entry)
    }
}

/// Routines stored as files named after their catalog entry
#[derive(Clone, PartialEq, Debug)]
pub struct RoutineDir {
    path: PathBuf,
}

impl RoutineDir {
    pub fn new<P: AsRef<Path>>(path: P) -> Self {
        Self { path: path.as_ref().to_path_buf() }
    }
}

impl RoutineSource for RoutineDir {
    fn load(&self, entry: &RoutineEntry) -> io::Result<String> {
        let path = self.path.join(entry.name);
        debug!("Loading routines from {}", path.display());
        fs::read_to_string(path)
    }
}
