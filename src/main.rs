//! tbd - text-based stub generator.
//!
//! Write `tapi-tbd-v2` descriptors for dylibs on disk or for the images of a
//! dyld shared cache.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context as _, Result};
use clap::{Args, Parser, Subcommand};
use tracing::{info, Level};
use tracing_subscriber::FmtSubscriber;

use tbd::macho::is_known_arch;
use tbd::{find_images, Context, DyldContext, Options, Summary};

/// Default locations to search for dyld shared caches on macOS.
const DEFAULT_CACHE_PATHS: &[&str] = &[
    // macOS Ventura+ (cryptex)
    "/System/Volumes/Preboot/Cryptexes/OS/System/Library/dyld",
    "/System/Library/dyld",
    "/var/db/dyld",
];

const CACHE_PREFIX: &str = "dyld_shared_cache_";

/// Generate text-based stubs for Mach-O dynamic libraries.
#[derive(Parser, Debug)]
#[command(name = "tbd")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

/// Where and how descriptors are written.
#[derive(Args, Debug)]
struct WriteArgs {
    /// Output file or directory (stdout if not specified)
    #[arg(short, long)]
    output: Option<PathBuf>,

    /// Mirror the input hierarchy under the output directory
    #[arg(long = "preserve-subdirs")]
    preserve_subdirs: bool,

    /// Keep existing output files
    #[arg(long)]
    no_overwrite: bool,

    /// Replace the input's extension with .tbd instead of appending it
    #[arg(long)]
    replace_path_extension: bool,

    /// Print each input path along with its output
    #[arg(long)]
    print_paths: bool,

    /// Don't warn about skipped inputs
    #[arg(long)]
    ignore_warnings: bool,

    /// Verbosity level (0=errors, 1=warnings, 2=info, 3=debug)
    #[arg(short, long, default_value = "1")]
    verbosity: u8,
}

impl WriteArgs {
    fn options(&self) -> Options {
        Options {
            output: self.output.clone(),
            preserve_subdirectories: self.preserve_subdirs,
            no_overwrite: self.no_overwrite,
            replace_path_extension: self.replace_path_extension,
            print_paths: self.print_paths,
            ignore_warnings: self.ignore_warnings,
            ..Options::default()
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Write stubs for dylibs (or directories of them)
    Parse {
        /// Files or directories to parse
        #[arg(required = true)]
        paths: Vec<PathBuf>,

        /// Parse the files inside directories
        #[arg(short, long)]
        recurse: bool,

        /// Also descend into subdirectories (implies --recurse)
        #[arg(long = "recurse-subdirs")]
        recurse_subdirs: bool,

        /// Only include these architectures (e.g. "arm64", "x86_64")
        #[arg(short, long)]
        arch: Vec<String>,

        #[command(flatten)]
        write: WriteArgs,
    },

    /// Write stubs for images of a dyld shared cache
    Dsc {
        /// Image path contains this string (can be repeated)
        #[arg(short, long)]
        filter: Vec<String>,

        /// Exact install path of an image (can be repeated)
        #[arg(short, long)]
        image: Vec<String>,

        /// Cache architecture, when the cache path is a directory
        #[arg(short, long)]
        arch: Option<String>,

        #[command(flatten)]
        write: WriteArgs,

        /// Path to the dyld shared cache (file or directory).
        /// If not specified, searches default system locations.
        cache: Option<PathBuf>,
    },

    /// List images in a dyld shared cache
    List {
        /// Filter images by name
        #[arg(short, long)]
        filter: Option<String>,

        /// Cache architecture, when the cache path is a directory
        #[arg(short, long)]
        arch: Option<String>,

        /// Show addresses
        #[arg(short = 'A', long)]
        addresses: bool,

        /// Show only basenames
        #[arg(short, long)]
        basenames: bool,

        /// Path to the dyld shared cache (file or directory).
        /// If not specified, searches default system locations.
        cache: Option<PathBuf>,
    },
}

/// A cache file found in a cache directory.
#[derive(Debug, Clone)]
struct CacheInfo {
    path: PathBuf,
    arch: String,
}

fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Commands::Parse {
            paths,
            recurse,
            recurse_subdirs,
            arch,
            write,
        } => {
            setup_logging(write.verbosity);
            if let Some(unknown) = arch.iter().find(|name| !is_known_arch(name)) {
                bail!("Unknown architecture: {}", unknown);
            }
            let options = Options {
                recurse: recurse || recurse_subdirs,
                recurse_subdirectories: recurse_subdirs,
                archs: (!arch.is_empty()).then_some(arch),
                ..write.options()
            };
            cmd_parse(&paths, options)
        }
        Commands::Dsc {
            cache,
            filter,
            image,
            arch,
            write,
        } => {
            setup_logging(write.verbosity);
            let options = Options {
                filters: filter,
                images: image,
                show_progress: write.output.is_some(),
                ..write.options()
            };
            cmd_dsc(cache, arch, options)
        }
        Commands::List {
            cache,
            filter,
            arch,
            addresses,
            basenames,
        } => cmd_list(cache, arch, filter, addresses, basenames),
    }
}

fn setup_logging(verbosity: u8) {
    let level = match verbosity {
        0 => Level::ERROR,
        1 => Level::WARN,
        2 => Level::INFO,
        _ => Level::DEBUG,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(level)
        .with_target(false)
        .without_time()
        .with_writer(std::io::stderr)
        .finish();

    tracing::subscriber::set_global_default(subscriber).ok();
}

fn finish(summary: Summary, start: Instant) -> Result<()> {
    info!(
        "Wrote {} descriptors ({} skipped) in {:.2}s",
        summary.written,
        summary.skipped,
        start.elapsed().as_secs_f64()
    );

    if summary.failed > 0 {
        bail!("{} inputs failed", summary.failed);
    }
    Ok(())
}

fn cmd_parse(paths: &[PathBuf], options: Options) -> Result<()> {
    let start = Instant::now();
    let ctx = Context::new(options);

    let mut summary = Summary::default();
    for path in paths {
        let parsed = ctx
            .parse_path(path)
            .with_context(|| format!("Failed to parse {}", path.display()))?;
        summary.merge(parsed);
    }

    finish(summary, start)
}

fn cmd_dsc(cache: Option<PathBuf>, arch: Option<String>, options: Options) -> Result<()> {
    let start = Instant::now();
    let cache_path = get_cache_path(cache)?;
    let resolved_path = resolve_cache_path(&cache_path, arch.as_deref())?;

    info!("Opening cache: {}", resolved_path.display());
    let ctx = Context::new(options);
    let summary = ctx
        .parse_cache(&resolved_path)
        .with_context(|| format!("Failed to parse cache: {}", resolved_path.display()))?;

    finish(summary, start)
}

fn cmd_list(
    cache: Option<PathBuf>,
    arch: Option<String>,
    filter: Option<String>,
    addresses: bool,
    basenames: bool,
) -> Result<()> {
    let cache_path = get_cache_path(cache)?;
    let resolved_path = resolve_cache_path(&cache_path, arch.as_deref())?;

    let cache = DyldContext::open(&resolved_path)
        .with_context(|| format!("Failed to open cache: {}", resolved_path.display()))?;

    for img in find_images(&cache, filter.as_deref()) {
        let name = if basenames { img.basename() } else { img.path.as_str() };

        if addresses {
            println!("{:#018x}  {}", img.address, name);
        } else {
            println!("{}", name);
        }
    }

    Ok(())
}

/// Finds the default dyld cache directory by checking known locations.
fn find_default_cache_dir() -> Result<PathBuf> {
    for path_str in DEFAULT_CACHE_PATHS {
        let path = Path::new(path_str);
        if path.is_dir() && discover_caches(path).is_ok_and(|caches| !caches.is_empty()) {
            return Ok(path.to_path_buf());
        }
    }

    bail!(
        "No dyld shared cache found in default locations:\n  {}",
        DEFAULT_CACHE_PATHS.join("\n  ")
    );
}

/// Gets the cache path, using defaults if not specified.
fn get_cache_path(cache: Option<PathBuf>) -> Result<PathBuf> {
    match cache {
        Some(path) => Ok(path),
        None => find_default_cache_dir(),
    }
}

/// Discovers the main cache files in a directory, skipping subcaches.
fn discover_caches(dir: &Path) -> Result<Vec<CacheInfo>> {
    let mut caches = Vec::new();

    for entry in fs::read_dir(dir)
        .with_context(|| format!("Failed to read directory: {}", dir.display()))?
    {
        let path = entry?.path();
        let Some(name) = path.file_name().and_then(|n| n.to_str()) else {
            continue;
        };

        // Subcaches carry a suffix such as .01 or .symbols.
        if name.contains('.') {
            continue;
        }
        if let Some(arch) = name.strip_prefix(CACHE_PREFIX) {
            caches.push(CacheInfo {
                arch: arch.to_string(),
                path,
            });
        }
    }

    caches.sort_by(|a, b| a.arch.cmp(&b.arch));
    Ok(caches)
}

/// Resolves a cache path with optional architecture filter.
///
/// A file is returned as is. In a directory the one cache matching `arch`
/// is picked.
fn resolve_cache_path(path: &Path, arch: Option<&str>) -> Result<PathBuf> {
    if path.is_file() {
        return Ok(path.to_path_buf());
    }

    if !path.is_dir() {
        bail!("Cache path does not exist: {}", path.display());
    }

    let caches = discover_caches(path)?;
    if caches.is_empty() {
        bail!("No dyld shared caches found in: {}", path.display());
    }

    let matching: Vec<_> = caches
        .iter()
        .filter(|c| arch.map_or(true, |wanted| c.arch.contains(wanted)))
        .collect();

    match matching.as_slice() {
        [] => {
            let available: Vec<_> = caches.iter().map(|c| c.arch.as_str()).collect();
            bail!(
                "No cache matches architecture '{}'. Available: {}",
                arch.unwrap_or(""),
                available.join(", ")
            );
        }
        [cache] => Ok(cache.path.clone()),
        _ => {
            let available: Vec<_> = matching.iter().map(|c| c.arch.as_str()).collect();
            bail!(
                "Multiple caches match. Please specify --arch. Available: {}",
                available.join(", ")
            );
        }
    }
}
