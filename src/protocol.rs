//! Wire constants for the STM8 ROM bootloader (UM0560)

/// Synchronisation character, also used by the bootloader for baud detection
pub const SYNCH: u8 = 0x7F;

pub const ACK: u8 = 0x79;
pub const NACK: u8 = 0x1F;

/// Largest window a single READ command can return
pub const READ_CHUNK: usize = 256;

/// Largest window a single WRITE command can accept
pub const WRITE_CHUNK: usize = 128;

/// Longest frame the host ever transmits (count + data + checksum)
pub const MAX_FRAME: usize = WRITE_CHUNK + 2;

/// Length of the GET response including both framing ACKs
pub const GET_RESPONSE_LEN: usize = 9;

/// Start of flash on every STM8 device
pub const FLASH_BASE: u32 = 0x8000;

/// Erase granularity
pub const SECTOR_SIZE: u32 = 1024;

/// Option byte enabling the ROM bootloader on the next reset (OPT17/NOPT17)
pub const OPT_BSL_ADDRESS: u32 = 0x487E;

/// Pattern written to [`OPT_BSL_ADDRESS`] to keep the bootloader active
pub const BSL_ACTIVATION: [u8; 2] = [0x55, 0xAA];

#[derive(Debug, PartialEq, Clone, Copy)]
pub enum Command {
    /// Fetch bootloader version and allowed commands
    Get = 0x00,

    /// Reads up to 256 bytes of memory starting from an address specified by the application.
    ReadMemory = 0x11,

    /// Jumps to user application code located in the internal Flash memory or in the SRAM.
    Go = 0x21,

    /// Writes up to 128 bytes to the RAM or Flash memory starting from an address specified by the application.
    WriteMemory = 0x31,

    /// Erases one or more 1 kB Flash sectors.
    Erase = 0x43,
}

impl Command {
    /// Opcodes the GET response must list, in order
    pub const SUPPORTED: [Command; 5] = [
        Command::Get,
        Command::ReadMemory,
        Command::Go,
        Command::WriteMemory,
        Command::Erase,
    ];

    pub fn code(self) -> u8 {
        self as u8
    }
}

/// One protocol-sized slice of a larger transfer
#[derive(Debug, PartialEq, Clone, Copy)]
pub struct Window {
    /// Target address of the first byte
    pub address: u32,
    /// Offset of the first byte within the transfer buffer
    pub offset: usize,
    pub len: usize,
}

/// Split `len` bytes starting at `address` into windows of at most `max` bytes.
///
/// Callers must ensure the range does not wrap past `u32::MAX`, see [`range_fits`].
pub fn windows(address: u32, len: usize, max: usize) -> impl Iterator<Item = Window> {
    (0..len).step_by(max.max(1)).map(move |offset| Window {
        address: address.wrapping_add(offset as u32),
        offset,
        len: (len - offset).min(max),
    })
}

/// Check `len` bytes starting at `address` stay within the 32-bit address space
pub fn range_fits(address: u32, len: usize) -> bool {
    address as u64 + len as u64 <= 1u64 << 32
}
