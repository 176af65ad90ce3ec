//! vmdkstream CLI - inspect and create stream-optimized VMDK files.

use std::fs::File;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand, ValueEnum};
use indicatif::{ProgressBar, ProgressStyle};
use log::LevelFilter;
use vmdkstream_core::vmdk::{format_bytes, stat, StreamOptimizedWriter, GRAIN_SIZE_BYTES};
use vmdkstream_core::{CompressionLevel, WriterOptions};

/// Inspect and create stream-optimized VMDK disk images.
#[derive(Parser)]
#[command(name = "vmdkstream")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Increase log verbosity (-v info, -vv debug).
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Display header and descriptor information about a VMDK file.
    Info {
        /// Path to the VMDK file.
        file: PathBuf,
    },

    /// Print the embedded text descriptor of a VMDK file.
    Descriptor {
        /// Path to the VMDK file.
        file: PathBuf,
    },

    /// Print the OVF envelope used to import a VMDK file.
    Ovf {
        /// Path to the VMDK file.
        file: PathBuf,
    },

    /// Convert a raw disk image into a stream-optimized VMDK.
    Convert {
        /// Path to the raw disk image.
        raw_file: PathBuf,

        /// Output VMDK path. Defaults to the input name with .vmdk extension.
        #[arg(short, long)]
        output: Option<PathBuf>,

        /// Virtual disk capacity in bytes. Defaults to the input file size.
        #[arg(long)]
        capacity: Option<u64>,

        /// Compression level (fast, balanced, max).
        #[arg(short, long, value_enum, default_value = "balanced")]
        compression: CompressionArg,

        /// Suppress progress output.
        #[arg(short, long)]
        quiet: bool,
    },
}

/// Compression level argument mapping.
#[derive(Debug, Clone, Copy, ValueEnum)]
enum CompressionArg {
    /// Fast compression (zlib level 1).
    Fast,
    /// Balanced compression (zlib level 6).
    Balanced,
    /// Maximum compression (zlib level 9).
    Max,
}

impl From<CompressionArg> for CompressionLevel {
    fn from(arg: CompressionArg) -> Self {
        match arg {
            CompressionArg::Fast => CompressionLevel::Fast,
            CompressionArg::Balanced => CompressionLevel::Balanced,
            CompressionArg::Max => CompressionLevel::Max,
        }
    }
}

fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose);

    match cli.command {
        Commands::Info { file } => show_info(&file)?,
        Commands::Descriptor { file } => {
            let info = stat(&file).with_context(|| format!("reading {}", file.display()))?;
            info.write(std::io::stdout().lock())?;
        }
        Commands::Ovf { file } => {
            let info = stat(&file).with_context(|| format!("reading {}", file.display()))?;
            println!("{}", info.ovf()?);
        }
        Commands::Convert {
            raw_file,
            output,
            capacity,
            compression,
            quiet,
        } => {
            run_convert(&raw_file, output.as_deref(), capacity, compression, quiet)?;
        }
    }

    Ok(())
}

fn init_logging(verbose: u8) {
    let level = match verbose {
        0 => LevelFilter::Warn,
        1 => LevelFilter::Info,
        _ => LevelFilter::Debug,
    };
    env_logger::Builder::new()
        .filter_level(level)
        .parse_default_env()
        .init();
}

fn show_info(file: &Path) -> Result<()> {
    let info = stat(file).with_context(|| format!("reading {}", file.display()))?;
    let header = &info.header;

    println!("VMDK Information");
    println!("================");
    println!();
    println!("Name:        {}", info.name);
    println!("Import name: {}", info.import_name);
    println!("File size:   {}", format_bytes(info.size));
    println!("Capacity:    {}", format_bytes(info.capacity));
    println!();
    println!("Header version:  {}", header.version);
    println!("Flags:           0x{:08X}", header.flags);
    println!("Grain size:      {} sectors", header.grain_size);
    println!("GD offset:       {} sectors", header.gd_offset);
    println!("Overhead:        {} sectors", header.overhead);
    println!();
    println!("Create type: {}", info.descriptor.create_type);
    println!("CID:         {}", info.descriptor.cid);
    println!("Parent CID:  {}", info.descriptor.parent_cid);

    if info.descriptor.extents.is_empty() {
        println!("Extents:     None");
    } else {
        println!("Extents:");
        for (i, extent) in info.descriptor.extents.iter().enumerate() {
            println!(
                "  {}. {} {} - {} ({})",
                i + 1,
                extent.permission,
                extent.extent_type,
                format_bytes(extent.size_bytes()),
                extent.info
            );
        }
    }

    Ok(())
}

fn run_convert(
    raw_file: &Path,
    output: Option<&Path>,
    capacity: Option<u64>,
    compression: CompressionArg,
    quiet: bool,
) -> Result<()> {
    let raw = File::open(raw_file).with_context(|| format!("opening {}", raw_file.display()))?;
    let capacity = match capacity {
        Some(capacity) => capacity,
        None => raw.metadata()?.len(),
    };

    let output_path = match output {
        Some(path) => path.to_path_buf(),
        None => raw_file.with_extension("vmdk"),
    };
    if output_path == raw_file {
        bail!("output {} would overwrite the input image", output_path.display());
    }

    if capacity % GRAIN_SIZE_BYTES != 0 {
        log::warn!(
            "capacity {} is not a multiple of the {} byte grain; the last {} bytes are dropped",
            capacity,
            GRAIN_SIZE_BYTES,
            capacity % GRAIN_SIZE_BYTES
        );
    }

    if !quiet {
        println!("Input:       {}", raw_file.display());
        println!("Output:      {}", output_path.display());
        println!("Capacity:    {}", format_bytes(capacity));
        println!("Compression: {:?}", CompressionLevel::from(compression));
        println!();
    }

    let options = WriterOptions::new(compression.into());
    let mut writer = StreamOptimizedWriter::create_with_options(&output_path, capacity, options)?;

    let progress = if quiet {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new(capacity);
        let style = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{wide_bar:.cyan/blue}] {bytes}/{total_bytes} ({bytes_per_sec}, {eta})")?
            .progress_chars("#>-");
        pb.set_style(style);
        pb
    };

    writer.write(progress.wrap_read(raw))?;
    writer.close()?;
    progress.finish_and_clear();

    if !quiet {
        println!("Conversion completed successfully: {}", output_path.display());

        if let Ok(metadata) = std::fs::metadata(&output_path) {
            let ratio = if capacity == 0 {
                0.0
            } else {
                (metadata.len() as f64 / capacity as f64) * 100.0
            };
            println!(
                "Output size: {} (compression ratio: {:.1}%)",
                format_bytes(metadata.len()),
                ratio
            );
        }
    }

    Ok(())
}
