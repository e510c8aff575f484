use std::path::PathBuf;

use anyhow::{bail, Context};
use clap::{Parser, ValueEnum};
use optrom_analyzer::{
    analyze, AnalysisReport, AnalyzeOptions, ConfigProbeEngine, DebugFlags, EngineConfig,
};
use optrom_lowmem::{DefaultAllocator, LowMemory, WindowAllocator, WindowAllocatorConfig};
use optrom_pci::PciBdf;
use tracing_subscriber::EnvFilter;

#[derive(Copy, Clone, Debug, PartialEq, Eq, ValueEnum)]
enum AllocatorKind {
    /// Host memory below 4 GiB
    Native,
    /// Addresses from a fixed window, backed by ordinary heap buffers
    Window,
}

#[derive(Parser, Debug)]
#[command(
    name = "optrom-analyzer",
    about = "Run a PCI option ROM against an emulated configuration space."
)]
struct Args {
    /// Device descriptor (JSON)
    #[arg(short = 'f', long = "file", value_name = "PATH")]
    descriptor: PathBuf,

    /// Print the report as JSON
    #[arg(long, action = clap::ArgAction::SetTrue)]
    json: bool,

    /// Where the ROM and BAR memory comes from
    #[arg(long, value_enum, default_value_t = AllocatorKind::Native)]
    allocator: AllocatorKind,

    /// First address of the window allocator
    #[arg(long, value_name = "ADDR", value_parser = parse_u32, default_value = "0xe0000000")]
    window_base: u32,

    /// Size of the window allocator in bytes
    #[arg(long, value_name = "BYTES", value_parser = parse_u32, default_value = "0x10000000")]
    window_size: u32,

    /// Memory size handed to the engine
    #[arg(long, value_name = "BYTES", value_parser = parse_u32, default_value = "0x10000")]
    mem_size: u32,

    /// PCI address reported for the device
    #[arg(long, value_name = "BB:DD.F", default_value = "00:00.0")]
    bdf: PciBdf,

    /// Disable per-access tracing in the engine
    #[arg(long, action = clap::ArgAction::SetTrue)]
    quiet_engine: bool,
}

fn parse_u32(text: &str) -> Result<u32, String> {
    let parsed = match text.strip_prefix("0x").or_else(|| text.strip_prefix("0X")) {
        Some(hex) => u32::from_str_radix(hex, 16),
        None => text.parse(),
    };
    parsed.map_err(|err| format!("{text:?} is not a 32-bit number: {err}"))
}

fn main() -> anyhow::Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();

    let args = Args::parse();

    let mut mem: Box<dyn LowMemory> = match args.allocator {
        AllocatorKind::Native => Box::new(DefaultAllocator::new()),
        AllocatorKind::Window => {
            if args.window_size == 0 {
                bail!("--window-size must be non-zero");
            }
            Box::new(WindowAllocator::new(WindowAllocatorConfig {
                base: args.window_base,
                size: args.window_size,
                ..Default::default()
            }))
        }
    };

    let mut debug = DebugFlags::default();
    if args.quiet_engine {
        debug.remove(DebugFlags::TRACE | DebugFlags::MEM_TRACE);
    }
    let options = AnalyzeOptions {
        bdf: args.bdf,
        engine: EngineConfig {
            debug,
            memory_size: args.mem_size,
        },
    };

    let mut engine = ConfigProbeEngine::new();
    let report = analyze(&args.descriptor, mem.as_mut(), &mut engine, &options)
        .with_context(|| format!("failed to analyze {}", args.descriptor.display()))?;

    if args.json {
        println!("{}", serde_json::to_string_pretty(&report)?);
    } else {
        print_report(&report);
    }
    Ok(())
}

fn print_report(report: &AnalysisReport) {
    let info = &report.device;
    println!("ROM:      {}", report.rom_path.display());
    println!(
        "  length {:#x} (declared {:#x}), checksum {}",
        report.rom.file_len,
        report.rom.declared_len,
        if report.rom.checksum_ok() { "ok" } else { "BAD" }
    );
    if let Some(pcir) = &report.rom.pcir {
        println!(
            "  PCIR {:04x}:{:04x} class {:02x}{:02x}{:02x}",
            pcir.vendor_id, pcir.device_id, pcir.class, pcir.subclass, pcir.prog_if
        );
    }
    println!(
        "Device:   {} {:04x}:{:04x} class {:08x}",
        info.bdf,
        info.vendor_id,
        info.device_id,
        info.class_code.to_dword()
    );
    println!("  ROM base {:#010x} len {:#x}", info.rom_base, info.rom_len);

    let probe = &report.probe;
    println!(
        "Probe:    {:04x}:{:04x}, {} config accesses",
        probe.vendor_id, probe.device_id, probe.accesses
    );
    for bar in probe.bars.iter().filter(|bar| bar.size != 0) {
        println!(
            "  BAR{} base {:#010x} size {:#x} (mask {:#010x})",
            bar.index, bar.base, bar.size, bar.mask
        );
    }
    println!("  expansion ROM {:#010x}", probe.rom_base);
}
