//! bootforge - Unpack, analyze and repack Android boot images
//!
//! This tool splits boot images into their segments, fingerprints the
//! kernel inside, and rebuilds images from (possibly modified) segments.

use anyhow::{bail, Context, Result};
use bootforge_core::image::{ComponentKind, ParsedImage};
use bootforge_core::kernel::DEFAULT_MAX_INPUT_SIZE;
use bootforge_core::{
    analyze_boot_image, AnalysisReport, AnalyzerConfig, BootConfig, BootImageBuilder,
    BootImageParser, ExtractedComponents, KernelAnalyzer, Provenance, ReportConfig,
};
use clap::{Args, Parser, Subcommand};
use serde_json::Value;
use std::fs;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use tracing::{debug, info, trace, warn, Level};
use tracing_subscriber::EnvFilter;
use walkdir::WalkDir;

/// Name of the boot config file written by `unpack` and read by `repack`
const BOOT_CONFIG_FILE: &str = "bootimg.json";

/// Unpack, analyze and repack Android boot images
#[derive(Parser, Debug)]
#[command(name = "bootforge")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Verbosity level (-v, -vv, -vvv)
    #[arg(short, long, action = clap::ArgAction::Count, global = true)]
    verbose: u8,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Print the header, boot config and segment summary of an image
    Info {
        /// Boot image to inspect
        image: PathBuf,
    },

    /// Write every segment and the boot config into a directory
    Unpack {
        /// Boot image to unpack
        image: PathBuf,

        /// Output directory
        #[arg(short, long)]
        output: PathBuf,

        /// Overwrite existing files
        #[arg(long)]
        force: bool,
    },

    /// Analyze boot images (or bare kernels) and print a JSON report
    Analyze(AnalyzeArgs),

    /// Build a boot image from segment files
    Repack(RepackArgs),
}

#[derive(Args, Debug)]
struct AnalyzeArgs {
    #[command(flatten)]
    input: InputMode,

    /// Treat inputs as bare kernels instead of boot images
    #[arg(long)]
    kernel_only: bool,

    /// Write the report to this file instead of stdout
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Largest kernel analyzed, in bytes
    #[arg(long, default_value_t = DEFAULT_MAX_INPUT_SIZE)]
    max_input_size: usize,

    /// Emit compact JSON
    #[arg(long)]
    compact: bool,
}

#[derive(Args, Debug)]
#[group(required = true, multiple = false)]
struct InputMode {
    /// Path to a single file to analyze
    #[arg(short, long)]
    file: Option<PathBuf>,

    /// Path to a directory to analyze recursively
    #[arg(short, long)]
    directory: Option<PathBuf>,
}

#[derive(Args, Debug)]
struct RepackArgs {
    /// Kernel image
    #[arg(long)]
    kernel: PathBuf,

    /// Ramdisk
    #[arg(long)]
    ramdisk: Option<PathBuf>,

    /// Second stage bootloader
    #[arg(long)]
    second: Option<PathBuf>,

    /// Device tree blob (header version 2)
    #[arg(long)]
    dtb: Option<PathBuf>,

    /// Recovery DTBO (header versions 1 and 2)
    #[arg(long)]
    recovery_dtbo: Option<PathBuf>,

    /// Boot config written by `unpack`
    #[arg(long)]
    config: Option<PathBuf>,

    /// Kernel command line (overrides the config)
    #[arg(long)]
    cmdline: Option<String>,

    /// Page size (overrides the config)
    #[arg(long)]
    page_size: Option<u32>,

    /// Header version (overrides the config)
    #[arg(long)]
    header_version: Option<u32>,

    /// Output image
    #[arg(short, long)]
    output: PathBuf,

    /// Overwrite an existing output file
    #[arg(long)]
    force: bool,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    // Initialize tracing
    let level = match cli.verbose {
        0 => Level::WARN,
        1 => Level::INFO,
        2 => Level::DEBUG,
        _ => Level::TRACE,
    };

    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(level.into()))
        .with_target(false)
        .with_writer(std::io::stderr)
        .init();

    match cli.command {
        Command::Info { image } => info_command(&image),
        Command::Unpack { image, output, force } => unpack(&image, &output, force),
        Command::Analyze(args) => analyze(&args),
        Command::Repack(args) => repack(&args),
    }
}

/// Read and parse a boot image file
fn parse_image(path: &Path) -> Result<ParsedImage> {
    if !path.is_file() {
        bail!("Input file does not exist: {}", path.display());
    }
    let data = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    trace!("Read {} bytes from {}", data.len(), path.display());

    let parsed = BootImageParser::new()
        .parse(&data)
        .with_context(|| format!("Failed to parse {}", path.display()))?;
    if parsed.provenance == Provenance::Heuristic {
        warn!(
            "{} has no boot image header; treating it as a bare kernel ({})",
            path.display(),
            parsed.strategy
        );
    }
    Ok(parsed)
}

fn info_command(image: &Path) -> Result<()> {
    let parsed = parse_image(image)?;
    let report = AnalysisReport::new(&parsed);
    println!("{}", report.to_json_pretty()?);
    Ok(())
}

fn unpack(image: &Path, output: &Path, force: bool) -> Result<()> {
    let parsed = parse_image(image)?;
    fs::create_dir_all(output)
        .with_context(|| format!("Failed to create directory: {}", output.display()))?;

    for (kind, data) in parsed.components.present() {
        let path = output.join(kind.as_str());
        write_atomic(&path, data, force)?;
        println!("Wrote {} ({} bytes)", path.display(), data.len());
    }

    let config_path = output.join(BOOT_CONFIG_FILE);
    let config = serde_json::to_string_pretty(parsed.components.config())?;
    write_atomic(&config_path, config.as_bytes(), force)?;
    println!("Wrote {}", config_path.display());
    Ok(())
}

fn analyze(args: &AnalyzeArgs) -> Result<()> {
    let report = if let Some(ref file) = args.input.file {
        if !file.is_file() {
            bail!("Input file does not exist: {}", file.display());
        }
        analyze_file(args, file)?
    } else if let Some(ref directory) = args.input.directory {
        analyze_directory(args, directory)?
    } else {
        bail!("Either --file or --directory must be specified")
    };

    let json = if args.compact {
        serde_json::to_string(&report)?
    } else {
        serde_json::to_string_pretty(&report)?
    };

    match &args.output {
        Some(path) => {
            write_atomic(path, json.as_bytes(), true)?;
            info!("Report written to {}", path.display());
        }
        None => println!("{}", json),
    }
    Ok(())
}

/// Analyze one file into a JSON value
fn analyze_file(args: &AnalyzeArgs, path: &Path) -> Result<Value> {
    let data = fs::read(path).with_context(|| format!("Failed to read {}", path.display()))?;
    let analyzer = AnalyzerConfig::new().max_input_size(args.max_input_size);

    if args.kernel_only {
        let kernel = KernelAnalyzer::with_config(analyzer)
            .analyze(&data)
            .with_context(|| format!("Failed to analyze kernel {}", path.display()))?;
        return Ok(serde_json::to_value(&kernel)?);
    }

    let config = ReportConfig::new().analyzer(analyzer);
    let report = analyze_boot_image(&data, &config)
        .with_context(|| format!("Failed to analyze {}", path.display()))?;
    Ok(serde_json::to_value(&report)?)
}

/// Analyze every candidate under a directory, continuing past failures
fn analyze_directory(args: &AnalyzeArgs, directory: &Path) -> Result<Value> {
    if !directory.is_dir() {
        bail!("Path is not a directory: {}", directory.display());
    }
    info!("Scanning directory: {}", directory.display());

    let mut results = Vec::new();
    for entry in WalkDir::new(directory)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_map(|e| e.ok())
    {
        let path = entry.path();
        if !path.is_file() || !is_candidate(path, args.kernel_only) {
            trace!("Skipping {}", path.display());
            continue;
        }

        debug!("Analyzing {}", path.display());
        let shown = path.display().to_string();
        let entry = match analyze_file(args, path) {
            Ok(report) => serde_json::json!({ "path": shown, "report": report }),
            Err(e) => {
                warn!("Error analyzing {}: {:#}", shown, e);
                serde_json::json!({ "path": shown, "error": format!("{:#}", e) })
            }
        };
        results.push(entry);
    }

    info!("Analyzed {} files", results.len());
    Ok(Value::Array(results))
}

/// Heuristic to decide whether a file is worth analyzing
fn is_candidate(path: &Path, kernel_only: bool) -> bool {
    let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");
    if name.starts_with('.') {
        return false;
    }
    if let Some(ext) = path.extension().and_then(|e| e.to_str()) {
        let skip_extensions = ["txt", "md", "json", "xml", "cfg", "log", "sh", "py"];
        if skip_extensions.contains(&ext.to_lowercase().as_str()) {
            return false;
        }
    }

    let mut magic = [0u8; 8];
    let has_boot_magic = fs::File::open(path)
        .and_then(|mut file| file.read_exact(&mut magic))
        .map(|()| &magic == b"ANDROID!")
        .unwrap_or(false);

    if kernel_only {
        return !has_boot_magic;
    }
    has_boot_magic || path.extension().is_some_and(|e| e == "img")
}

fn repack(args: &RepackArgs) -> Result<()> {
    let mut config = match &args.config {
        Some(path) => {
            let text = fs::read(path)
                .with_context(|| format!("Failed to read boot config {}", path.display()))?;
            serde_json::from_slice::<BootConfig>(&text)
                .with_context(|| format!("Invalid boot config {}", path.display()))?
        }
        None => BootConfig::default(),
    };
    if let Some(cmdline) = &args.cmdline {
        config.cmdline = cmdline.clone();
    }
    if let Some(page_size) = args.page_size {
        config.page_size = page_size;
    }
    if let Some(version) = args.header_version {
        config.header_version = version;
    }

    let kernel = read_segment(&args.kernel)?;
    let mut components = ExtractedComponents::new(kernel, config);
    let optional = [
        (ComponentKind::Ramdisk, &args.ramdisk),
        (ComponentKind::Second, &args.second),
        (ComponentKind::Dtb, &args.dtb),
        (ComponentKind::RecoveryDtbo, &args.recovery_dtbo),
    ];
    for (kind, path) in optional {
        if let Some(path) = path {
            components = components.with_component(kind, read_segment(path)?);
        }
    }

    let image = BootImageBuilder::new()
        .build(&components, None)
        .context("Failed to build boot image")?;
    write_atomic(&args.output, &image, args.force)?;
    println!("Wrote {} ({} bytes)", args.output.display(), image.len());
    Ok(())
}

fn read_segment(path: &Path) -> Result<Vec<u8>> {
    fs::read(path).with_context(|| format!("Failed to read {}", path.display()))
}

/// Write a file through a temporary sibling so a failure never leaves a partial file
fn write_atomic(path: &Path, data: &[u8], force: bool) -> Result<()> {
    if path.exists() && !force {
        bail!("File already exists: {} (use --force to overwrite)", path.display());
    }

    let parent = match path.parent() {
        Some(p) if !p.as_os_str().is_empty() => p,
        _ => Path::new("."),
    };
    fs::create_dir_all(parent)
        .with_context(|| format!("Failed to create directory: {}", parent.display()))?;

    let mut file = tempfile::NamedTempFile::new_in(parent)
        .with_context(|| format!("Failed to create temporary file in {}", parent.display()))?;
    file.write_all(data)
        .with_context(|| format!("Failed to write file: {}", path.display()))?;
    file.persist(path)
        .with_context(|| format!("Failed to write file: {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_image() -> Vec<u8> {
        let mut kernel = vec![0u8; 0x40];
        kernel[0x38..0x3C].copy_from_slice(b"ARM\x64");
        kernel.extend_from_slice(b"Linux version 5.10.43 (a@b) #1\n");

        let components = ExtractedComponents::new(
            kernel,
            BootConfig::new().header_version(1).cmdline("console=ttyS0"),
        )
        .with_component(ComponentKind::Ramdisk, b"070701 ramdisk".to_vec());
        BootImageBuilder::new().build(&components, None).unwrap().to_vec()
    }

    #[test]
    fn test_unpack_then_repack() {
        let temp_dir = TempDir::new().unwrap();
        let image_path = temp_dir.path().join("boot.img");
        fs::write(&image_path, sample_image()).unwrap();

        let out = temp_dir.path().join("unpacked");
        unpack(&image_path, &out, false).unwrap();
        assert!(out.join("kernel").is_file());
        assert_eq!(fs::read(out.join("ramdisk")).unwrap(), b"070701 ramdisk");
        assert!(!out.join("dtb").exists());

        // Unpacking again without --force must not clobber
        assert!(unpack(&image_path, &out, false).is_err());

        let repacked = temp_dir.path().join("new.img");
        let args = RepackArgs {
            kernel: out.join("kernel"),
            ramdisk: Some(out.join("ramdisk")),
            second: None,
            dtb: None,
            recovery_dtbo: None,
            config: Some(out.join(BOOT_CONFIG_FILE)),
            cmdline: None,
            page_size: None,
            header_version: None,
            output: repacked.clone(),
            force: false,
        };
        repack(&args).unwrap();
        assert_eq!(fs::read(&repacked).unwrap(), sample_image());
    }

    #[test]
    fn test_repack_rejects_empty_kernel() {
        let temp_dir = TempDir::new().unwrap();
        let kernel = temp_dir.path().join("kernel");
        fs::write(&kernel, b"").unwrap();
        let output = temp_dir.path().join("out.img");

        let args = RepackArgs {
            kernel,
            ramdisk: None,
            second: None,
            dtb: None,
            recovery_dtbo: None,
            config: None,
            cmdline: Some("quiet".to_string()),
            page_size: None,
            header_version: None,
            output: output.clone(),
            force: false,
        };
        assert!(repack(&args).is_err());
        assert!(!output.exists());
    }

    #[test]
    fn test_write_atomic_respects_force() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("file.bin");

        write_atomic(&path, b"one", false).unwrap();
        assert!(write_atomic(&path, b"two", false).is_err());
        write_atomic(&path, b"two", true).unwrap();
        assert_eq!(fs::read(&path).unwrap(), b"two");
    }

    #[test]
    fn test_analyze_directory_continues_past_errors() {
        let temp_dir = TempDir::new().unwrap();
        fs::write(temp_dir.path().join("a-boot.img"), sample_image()).unwrap();
        fs::write(temp_dir.path().join("b-broken.img"), b"not a boot image at all").unwrap();
        fs::write(temp_dir.path().join("notes.txt"), b"ANDROID! but text").unwrap();

        let args = AnalyzeArgs {
            input: InputMode {
                file: None,
                directory: Some(temp_dir.path().to_path_buf()),
            },
            kernel_only: false,
            output: None,
            max_input_size: DEFAULT_MAX_INPUT_SIZE,
            compact: true,
        };
        let results = analyze_directory(&args, temp_dir.path()).unwrap();
        let results = results.as_array().unwrap();

        assert_eq!(results.len(), 2);
        assert_eq!(results[0]["report"]["kernel"]["kernel_version"], "5.10.43");
        assert!(results[1]["error"].is_string());
    }

    #[test]
    fn test_is_candidate() {
        let temp_dir = TempDir::new().unwrap();
        let boot = temp_dir.path().join("boot");
        fs::write(&boot, b"ANDROID!....").unwrap();
        let text = temp_dir.path().join("readme.md");
        fs::write(&text, b"ANDROID!").unwrap();

        assert!(is_candidate(&boot, false));
        assert!(!is_candidate(&boot, true));
        assert!(!is_candidate(&text, false));
        assert!(!is_candidate(Path::new("/tmp/.hidden.img"), false));
    }

    #[test]
    fn verify_cli() {
        use clap::CommandFactory;
        Cli::command().debug_assert();
    }
}
