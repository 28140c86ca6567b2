use std::io::ErrorKind as IoErrorKind;
use std::path::PathBuf;

#[macro_use]
extern crate log;

extern crate structopt;
use structopt::StructOpt;

extern crate simplelog;
use simplelog::{Config, LevelFilter, SimpleLogger};

use anyhow::Context;
use indicatif::{ProgressBar, ProgressStyle};
use linux_embedded_hal::{Delay, Serial};

use stm8_uart_loader::{Firmware, Options, Programmer, Progress, RoutineDir, UploadPlan};

type LinuxProgrammer = Programmer<Serial, Delay, IoErrorKind>;

#[derive(Clone, Debug, StructOpt)]
pub struct Args {
    /// Serial port to connect to
    #[structopt(long, default_value = "/dev/ttyUSB0")]
    port: String,

    /// Serial port baud rate
    #[structopt(long, default_value = "115200")]
    baud: usize,

    #[structopt(flatten)]
    options: Options,

    /// Firmware to upload (.s19, .hex or .ihx)
    #[structopt(short = "f", long = "file")]
    file: Option<PathBuf>,

    /// Directory containing the E_W_ROUTINEs_*.s19 files
    #[structopt(long, default_value = ".")]
    routines: PathBuf,

    /// Don't write the option bytes that keep the ROM bootloader enabled
    #[structopt(short = "x", long)]
    no_bsl: bool,

    /// Don't jump to flash after uploading
    #[structopt(short = "j", long)]
    no_jump: bool,

    /// Erase the flash sectors covered by the firmware before writing
    #[structopt(long)]
    erase: bool,

    /// Read back and compare the firmware after writing
    #[structopt(long)]
    verify: bool,

    /// Print a hex dump of device memory instead of uploading
    #[structopt(long, number_of_values = 2, value_names = &["ADDRESS", "COUNT"], parse(try_from_str = parse_u32))]
    dump: Option<Vec<u32>>,

    /// Log level for console output
    #[structopt(long, default_value = "info")]
    log_level: LevelFilter,
}

fn parse_u32(s: &str) -> Result<u32, std::num::ParseIntError> {
    match s.strip_prefix("0x").or_else(|| s.strip_prefix("0X")) {
        Some(h) => u32::from_str_radix(h, 16),
        None => s.parse(),
    }
}

fn progress_bar() -> ProgressBar {
    let bar = ProgressBar::new(0);
    bar.set_style(
        ProgressStyle::default_bar()
            .template("{msg:>14} [{bar:40}] {bytes}/{total_bytes}")
            .progress_chars("=> "),
    );
    bar
}

fn show(bar: &ProgressBar, p: Progress) {
    bar.set_length(p.total as u64);
    bar.set_position(p.complete as u64);
    bar.set_message(&format!("{:?}", p.phase));
}

fn main() -> anyhow::Result<()> {
    // Parse out arguments
    let o = Args::from_args();

    // Configure logger
    let _ = SimpleLogger::init(o.log_level, Config::default());

    info!("Connecting to serial port");

    let mut p = Programmer::linux(&o.port, o.baud, o.options.clone())
        .with_context(|| format!("Error connecting to serial port {}", o.port))?;

    let res = match &o.dump {
        Some(d) => dump(&mut p, d[0], d[1] as usize),
        None => upload(&mut p, &o),
    };

    p.close();

    res
}

fn upload(p: &mut LinuxProgrammer, o: &Args) -> anyhow::Result<()> {
    let firmware = match &o.file {
        Some(f) => {
            let fw = Firmware::load(f).with_context(|| format!("Error reading {}", f.display()))?;
            info!("Loaded {}", fw.name());
            Some(fw)
        }
        None => None,
    };

    let plan = UploadPlan {
        firmware,
        erase: o.erase,
        verify: o.verify,
        enable_bsl: !o.no_bsl,
        jump: !o.no_jump,
    };

    let bar = progress_bar();
    let res = p.run(&plan, &RoutineDir::new(&o.routines), |r| show(&bar, r));
    bar.finish_and_clear();

    let device = res.context("Upload failed")?;
    info!("Done ({})", device);

    Ok(())
}

fn dump(p: &mut LinuxProgrammer, address: u32, count: usize) -> anyhow::Result<()> {
    info!("Connecting to bootloader");
    p.init().context("Error connecting to bootloader")?;

    let device = p.get_info().context("Error identifying device")?;
    info!("Device: {}", device);

    let bar = progress_bar();
    let res = p.read_mem_with(address, count, |r| show(&bar, r));
    bar.finish_and_clear();

    let data = res.with_context(|| format!("Error reading memory at 0x{:04x}", address))?;
    info!("Read {} from 0x{:04x}", bytefmt::format(data.len() as u64), address);

    for (i, line) in data.chunks(16).enumerate() {
        println!("{:08x}: {}", address as usize + i * 16, hex::encode(line));
    }

    Ok(())
}
