//! Command-line front end: boot a disk image and run it to completion,
//! printing nothing but whatever the guest itself writes to the display.

use anyhow::Context;
use clap::Parser;
use x86emu::{CpuMode, ExitCondition, FileBootStream, Machine, RuntimeOptions};

#[derive(Parser, Debug)]
#[command(name = "x86emu", about = "Run a boot-sector disk image to completion")]
struct Args {
    /// Path to the disk image; sector 0 is loaded at 0x7C00 and must end in 0x55AA.
    #[arg(long)]
    disk: std::path::PathBuf,

    /// Physical RAM size in MiB.
    #[arg(long, default_value_t = 16)]
    ram: u64,

    /// CPU mode to start execution in.
    #[arg(long, value_enum, default_value_t = CliCpuMode::Real)]
    mode: CliCpuMode,

    /// Abort the run after this many retired instructions instead of
    /// letting a runaway guest spin forever.
    #[arg(long)]
    max_insts: Option<u64>,

    /// Record a call-trace ring buffer for postmortem diagnostics on failure.
    #[arg(long)]
    diagnostics: bool,
}

#[derive(Clone, Copy, Debug, clap::ValueEnum)]
enum CliCpuMode {
    Real,
    Protected,
    Long,
}

impl From<CliCpuMode> for CpuMode {
    fn from(m: CliCpuMode) -> Self {
        match m {
            CliCpuMode::Real => CpuMode::Real,
            CliCpuMode::Protected => CpuMode::Protected,
            CliCpuMode::Long => CpuMode::Long,
        }
    }
}

fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();

    let boot = FileBootStream::open(&args.disk)
        .with_context(|| format!("opening disk image {}", args.disk.display()))?;

    let options = RuntimeOptions::default()
        .with_max_ram(args.ram * 1024 * 1024)
        .with_diagnostics(args.diagnostics);
    let options = match args.max_insts {
        Some(n) => options.with_max_steps(n),
        None => options,
    };

    let machine = Machine::new(Box::new(boot), options, args.mode.into()).context("loading boot image")?;
    let exit = machine.runtime(0x7C00).start().context("running guest")?;

    match exit {
        ExitCondition::Halt => {}
        ExitCondition::DosExit(code) => std::process::exit(code as i32),
        ExitCondition::TripleFault => {
            eprintln!("guest triple-faulted");
            std::process::exit(1);
        }
    }
    Ok(())
}
