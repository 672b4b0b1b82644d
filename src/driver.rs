//! Output driver.
//!
//! Walks the inputs named on the command line, builds one descriptor per
//! dylib (or per selected shared cache image) and writes it either to
//! stdout or under an output directory.
//!
//! Output files are created with [`open_r`], which also creates any missing
//! directories above them. If writing the document fails afterwards, a new
//! file and the directories created for it are removed again.

use std::ffi::OsStr;
use std::fs;
use std::io::{self, BufWriter, Write};
use std::os::unix::ffi::OsStrExt;
use std::path::{Path, PathBuf};

use indicatif::{ProgressBar, ProgressStyle};
use tracing::{debug, error, info, warn};

use crate::dyld::{is_cache, DyldContext, ImageEntry};
use crate::error::{Error, Result};
use crate::macho::slices;
use crate::path::{
    append_component_and_extension, find_extension, last_component, PathBuffer, WorkingDirectory,
};
use crate::recursive::{open_r, remove_partial_r, OpenFlags};
use crate::tbd::{write_tbd, TbdCreateInfo};
use crate::util::map_file;

/// Permissions for created descriptors, before the umask.
const FILE_MODE: u32 = 0o644;

/// Permissions for created directories, before the umask.
const DIRECTORY_MODE: u32 = 0o755;

const TBD_EXTENSION: &[u8] = b"tbd";

/// Options for a run.
#[derive(Debug, Clone, Default)]
pub struct Options {
    /// Parse the files inside directories named as inputs
    pub recurse: bool,
    /// Also descend into subdirectories while recursing
    pub recurse_subdirectories: bool,
    /// Mirror the input hierarchy under the output directory
    pub preserve_subdirectories: bool,
    /// Leave existing output files alone
    pub no_overwrite: bool,
    /// Replace the input's extension with `.tbd` instead of appending it
    pub replace_path_extension: bool,
    /// Print each input path next to its output
    pub print_paths: bool,
    /// Silence warnings about skipped inputs
    pub ignore_warnings: bool,
    /// Show a progress bar while writing many cache images
    pub show_progress: bool,
    /// Only keep slices of these architectures
    pub archs: Option<Vec<String>>,
    /// Output file or directory; stdout when absent
    pub output: Option<PathBuf>,
    /// Cache images whose path contains any of these strings
    pub filters: Vec<String>,
    /// Cache images with exactly these paths
    pub images: Vec<String>,
}

/// Counts of what a run did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Summary {
    /// Descriptors written
    pub written: usize,
    /// Inputs recognized but not written
    pub skipped: usize,
    /// Inputs that failed
    pub failed: usize,
}

impl Summary {
    /// Adds the counts of `other` to this summary.
    pub fn merge(&mut self, other: Summary) {
        self.written += other.written;
        self.skipped += other.skipped;
        self.failed += other.failed;
    }

    fn record(&mut self, written: bool) {
        if written {
            self.written += 1;
        } else {
            self.skipped += 1;
        }
    }
}

/// Drops the extension of the final component of `path`, dot included.
fn strip_extension(path: &[u8]) -> &[u8] {
    match find_extension(path) {
        Some(after_dot) if memchr::memchr(b'/', &path[after_dot..]).is_none() => {
            &path[..after_dot - 1]
        }
        _ => path,
    }
}

/// What a mapped input turned out to be.
enum Input {
    /// A shared cache, to be opened as one
    Cache,
    /// A Mach-O file; `None` if no slice was selected
    Macho(Option<TbdCreateInfo>),
}

fn path_from_bytes(bytes: &[u8]) -> PathBuf {
    PathBuf::from(OsStr::from_bytes(bytes))
}

/// Shared state for a run: the options and the working directory cache.
#[derive(Debug)]
pub struct Context {
    cwd: WorkingDirectory,
    options: Options,
}

impl Context {
    /// Creates a context that resolves relative paths against the process
    /// working directory.
    pub fn new(options: Options) -> Self {
        Self::with_working_directory(options, WorkingDirectory::new())
    }

    /// Creates a context with an explicit working directory cache.
    pub fn with_working_directory(options: Options, cwd: WorkingDirectory) -> Self {
        Self { cwd, options }
    }

    /// Options of this run.
    pub fn options(&self) -> &Options {
        &self.options
    }

    fn resolve(&self, path: &Path) -> Result<PathBuf> {
        let resolved = self.cwd.resolve(path.as_os_str().as_bytes())?;
        Ok(path_from_bytes(&resolved))
    }

    fn output_root(&self) -> Result<Option<PathBuf>> {
        self.options
            .output
            .as_deref()
            .map(|out| self.resolve(out))
            .transpose()
    }

    fn warn_skipped(&self, input: &Path, reason: &str) {
        if !self.options.ignore_warnings {
            warn!("Skipping {}: {}", input.display(), reason);
        }
    }

    // =========================================================================
    // Output Paths
    // =========================================================================

    /// Builds the path a descriptor for `file_path` is written to.
    ///
    /// `file_in_parse_dir` says that `file_path` is relative to the directory
    /// being parsed (or is a cache image path). Such paths keep their
    /// hierarchy when subdirectories are preserved; every other path is
    /// reduced to its last component.
    pub fn create_write_path(
        &self,
        root: &[u8],
        file_path: &[u8],
        file_in_parse_dir: bool,
        extension: Option<&[u8]>,
    ) -> Result<PathBuffer> {
        let mut component = if file_in_parse_dir && self.options.preserve_subdirectories {
            file_path
        } else {
            last_component(file_path).unwrap_or(file_path)
        };
        if self.options.replace_path_extension {
            component = strip_extension(component);
        }

        append_component_and_extension(root, component, extension)
    }

    // =========================================================================
    // Writing
    // =========================================================================

    /// Writes `info` to `buffer`, creating missing directories on the way.
    ///
    /// Existing files are truncated, or left alone with
    /// [`Error::OutputExists`] when `no_overwrite` is set. If the document
    /// cannot be written, a file created by this call is removed along with
    /// any directories created for it. A file that already existed stays.
    pub fn write_to_path(&self, info: &TbdCreateInfo, buffer: &mut PathBuffer) -> Result<()> {
        let flags = if self.options.no_overwrite {
            OpenFlags::WRITE_ONLY | OpenFlags::EXCLUSIVE
        } else {
            OpenFlags::WRITE_ONLY | OpenFlags::TRUNCATE
        };
        // An exclusive open fails on existing files, so only truncation can
        // land on one.
        let existed =
            !self.options.no_overwrite && fs::symlink_metadata(buffer.as_path()).is_ok();

        let (file, terminator) = match open_r(buffer, flags, FILE_MODE, DIRECTORY_MODE) {
            Ok(opened) => opened,
            Err(source)
                if self.options.no_overwrite && source.kind() == io::ErrorKind::AlreadyExists =>
            {
                return Err(Error::OutputExists {
                    path: buffer.as_path().to_path_buf(),
                });
            }
            Err(source) => {
                return Err(Error::OutputCreate {
                    path: buffer.as_path().to_path_buf(),
                    source,
                });
            }
        };

        let mut writer = BufWriter::new(file);
        let written = write_tbd(info, &mut writer).and_then(|()| writer.flush());
        drop(writer);

        if let Err(source) = written {
            let path = buffer.as_path().to_path_buf();
            if existed {
                return Err(Error::OutputWrite { path, source });
            }
            if let Err(cleanup) = remove_partial_r(buffer, terminator) {
                warn!("Failed to remove partial output {}: {}", path.display(), cleanup);
            }
            return Err(Error::OutputWrite { path, source });
        }

        Ok(())
    }

    /// Writes `info` to stdout, preceded by a comment naming `input` when
    /// paths are printed.
    pub fn write_to_stdout(&self, info: &TbdCreateInfo, input: &Path) -> Result<()> {
        let stdout = io::stdout();
        let mut out = stdout.lock();
        self.write_document(info, input, &mut out)?;
        Ok(())
    }

    fn write_document<W: Write>(
        &self,
        info: &TbdCreateInfo,
        input: &Path,
        out: &mut W,
    ) -> io::Result<()> {
        if self.options.print_paths {
            writeln!(out, "# {}", input.display())?;
        }
        write_tbd(info, out)?;
        out.flush()
    }

    /// Writes `info` to `destination`, or stdout without one.
    ///
    /// Returns false if an existing file was kept because of `no_overwrite`.
    fn emit(
        &self,
        info: &TbdCreateInfo,
        input: &Path,
        destination: Option<PathBuffer>,
    ) -> Result<bool> {
        let Some(mut buffer) = destination else {
            self.write_to_stdout(info, input)?;
            return Ok(true);
        };

        match self.write_to_path(info, &mut buffer) {
            Ok(()) => {}
            Err(Error::OutputExists { path }) => {
                self.warn_skipped(input, &format!("{} already exists", path.display()));
                return Ok(false);
            }
            Err(e) => return Err(e),
        }

        if self.options.print_paths {
            println!("{} -> {}", input.display(), buffer.as_path().display());
        }
        debug!("Wrote {}", buffer.as_path().display());
        Ok(true)
    }

    // =========================================================================
    // Mach-O Files
    // =========================================================================

    fn arch_selected(&self, arch: &str) -> bool {
        self.options
            .archs
            .as_ref()
            .map_or(true, |archs| archs.iter().any(|wanted| wanted == arch))
    }

    /// Builds a descriptor from a thin or fat Mach-O file.
    ///
    /// Slices of unsupported or unselected architectures are left out.
    /// Returns `None` if no slice is left.
    pub fn create_info(&self, input: &Path, data: &[u8]) -> Result<Option<TbdCreateInfo>> {
        let mut info = TbdCreateInfo::new();
        for slice in slices(data)? {
            let arch = match slice.arch_name() {
                Ok(arch) => arch,
                Err(e) => {
                    self.warn_skipped(input, &e.to_string());
                    continue;
                }
            };
            if !self.arch_selected(arch) {
                debug!("Leaving out {} slice of {}", arch, input.display());
                continue;
            }
            info.add_macho(&slice)?;
        }

        Ok((!info.is_empty()).then_some(info))
    }

    /// Maps `path` and builds its descriptor unless it is a shared cache.
    fn read_input(&self, path: &Path) -> Result<Input> {
        let metadata = fs::metadata(path).map_err(|source| Error::FileOpen {
            path: path.to_path_buf(),
            source,
        })?;
        if metadata.len() == 0 {
            return Err(Error::UnrecognizedFormat);
        }

        let mmap = map_file(path)?;
        if is_cache(&mmap) {
            return Ok(Input::Cache);
        }
        self.create_info(path, &mmap).map(Input::Macho)
    }

    /// Parses a file or, with `recurse`, a directory.
    pub fn parse_path(&self, path: &Path) -> Result<Summary> {
        let path = self.resolve(path)?;
        if path.is_dir() {
            if !self.options.recurse {
                return Err(Error::IsADirectory { path });
            }
            return self.parse_directory(&path);
        }
        self.parse_file(&path)
    }

    /// Parses one Mach-O file or shared cache.
    ///
    /// A Mach-O descriptor goes to the output path itself, or into it when
    /// it is an existing directory.
    pub fn parse_file(&self, path: &Path) -> Result<Summary> {
        let path = self.resolve(path)?;
        let info = match self.read_input(&path)? {
            Input::Macho(info) => info,
            Input::Cache => return self.parse_cache(&path),
        };

        let mut summary = Summary::default();
        let Some(info) = info else {
            self.warn_skipped(&path, "no selected architectures");
            summary.skipped += 1;
            return Ok(summary);
        };

        let destination = match self.output_root()? {
            Some(out) if out.is_dir() => Some(self.create_write_path(
                out.as_os_str().as_bytes(),
                path.as_os_str().as_bytes(),
                false,
                Some(TBD_EXTENSION),
            )?),
            Some(out) => Some(PathBuffer::from_path(&out)?),
            None => None,
        };

        summary.record(self.emit(&info, &path, destination)?);
        Ok(summary)
    }

    // =========================================================================
    // Directories
    // =========================================================================

    /// Parses every dylib in `root`, and in its subdirectories with
    /// `recurse_subdirectories`.
    ///
    /// Files that are not dylibs are skipped without a word. Other failures
    /// are logged and counted, and the walk goes on.
    pub fn parse_directory(&self, root: &Path) -> Result<Summary> {
        let root = self.resolve(root)?;
        let output = self.output_root()?;

        let mut summary = Summary::default();
        self.walk(&root, &root, output.as_deref(), &mut summary)?;

        info!(
            "{}: wrote {} descriptors, skipped {}, {} failed",
            root.display(),
            summary.written,
            summary.skipped,
            summary.failed
        );
        Ok(summary)
    }

    fn walk(
        &self,
        root: &Path,
        dir: &Path,
        output: Option<&Path>,
        summary: &mut Summary,
    ) -> Result<()> {
        let read_error = |source| Error::DirectoryRead {
            path: dir.to_path_buf(),
            source,
        };
        let mut entries = fs::read_dir(dir)
            .and_then(|entries| entries.collect::<io::Result<Vec<_>>>())
            .map_err(read_error)?;
        entries.sort_by_key(|entry| entry.file_name());

        for entry in entries {
            let path = entry.path();
            let file_type = entry.file_type().map_err(read_error)?;

            if file_type.is_dir() {
                if !self.options.recurse_subdirectories {
                    continue;
                }
                match self.walk(root, &path, output, summary) {
                    Ok(()) => {}
                    Err(e) if e.is_recoverable() => {
                        error!("{}", e);
                        summary.failed += 1;
                    }
                    Err(e) => return Err(e),
                }
                continue;
            }

            // Symlinks are followed to files, never to directories.
            if !file_type.is_file() && !path.is_file() {
                continue;
            }

            match self.parse_entry(root, &path, output) {
                Ok(written) => summary.record(written),
                Err(e) if e.is_unrecognized() || matches!(e, Error::NotADylib(_)) => {
                    debug!("Ignoring {}: {}", path.display(), e);
                }
                Err(e) if e.is_recoverable() => {
                    error!("{}: {}", path.display(), e);
                    summary.failed += 1;
                }
                Err(e) => return Err(e),
            }
        }

        Ok(())
    }

    fn parse_entry(&self, root: &Path, path: &Path, output: Option<&Path>) -> Result<bool> {
        let Input::Macho(info) = self.read_input(path)? else {
            debug!("Not descending into shared cache {}", path.display());
            return Err(Error::UnrecognizedFormat);
        };
        let Some(info) = info else {
            self.warn_skipped(path, "no selected architectures");
            return Ok(false);
        };

        let destination = output
            .map(|out| {
                let relative = path.strip_prefix(root).unwrap_or(path);
                self.create_write_path(
                    out.as_os_str().as_bytes(),
                    relative.as_os_str().as_bytes(),
                    true,
                    Some(TBD_EXTENSION),
                )
            })
            .transpose()?;

        self.emit(&info, path, destination)
    }

    // =========================================================================
    // Shared Caches
    // =========================================================================

    /// Returns the cache images selected by the image paths and filters, or
    /// every image when neither is given.
    pub fn select_images<'c>(&self, cache: &'c DyldContext) -> Result<Vec<&'c ImageEntry>> {
        let Options {
            filters, images, ..
        } = &self.options;
        if filters.is_empty() && images.is_empty() {
            return Ok(cache.iter_images().collect());
        }

        if let Some(missing) = images.iter().find(|path| cache.find_image(path).is_none()) {
            return Err(Error::ImageNotFound {
                name: missing.clone(),
            });
        }

        Ok(cache
            .iter_images()
            .filter(|image| {
                images.iter().any(|path| *path == image.path)
                    || filters.iter().any(|filter| image.matches_filter(filter))
            })
            .collect())
    }

    fn progress_bar(&self, len: usize) -> ProgressBar {
        if !self.options.show_progress || len < 2 {
            return ProgressBar::hidden();
        }

        let bar = ProgressBar::new(len as u64);
        if let Ok(style) = ProgressStyle::default_bar()
            .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} {msg}")
        {
            bar.set_style(style.progress_chars("#>-"));
        }
        bar
    }

    /// Writes a descriptor for every selected image of the cache at `path`.
    pub fn parse_cache(&self, path: &Path) -> Result<Summary> {
        let path = self.resolve(path)?;
        let cache = DyldContext::open(&path)?;
        let images = self.select_images(&cache)?;
        if images.is_empty() {
            self.warn_skipped(&path, "no images match the filters");
        }

        let output = self.output_root()?;
        let single_file = output.as_deref().is_some_and(|out| {
            self.options.filters.is_empty() && self.options.images.len() == 1 && !out.is_dir()
        });

        info!(
            "Writing {} of {} images from {}",
            images.len(),
            cache.image_count(),
            path.display()
        );

        let progress = self.progress_bar(images.len());
        let mut summary = Summary::default();
        for image in images {
            progress.set_message(image.basename().to_string());
            match self.parse_cache_image(&cache, image, output.as_deref(), single_file) {
                Ok(written) => summary.record(written),
                Err(e) if e.is_recoverable() => {
                    progress.suspend(|| error!("{}: {}", image.path, e));
                    summary.failed += 1;
                }
                Err(e) => return Err(e),
            }
            progress.inc(1);
        }
        progress.finish_and_clear();

        info!(
            "{}: wrote {} descriptors, skipped {}, {} failed",
            path.display(),
            summary.written,
            summary.skipped,
            summary.failed
        );
        Ok(summary)
    }

    fn parse_cache_image(
        &self,
        cache: &DyldContext,
        image: &ImageEntry,
        output: Option<&Path>,
        single_file: bool,
    ) -> Result<bool> {
        let mut info = TbdCreateInfo::new();
        info.add_cache_image(cache, image)?;

        let destination = match output {
            Some(out) if single_file => Some(PathBuffer::from_path(out)?),
            Some(out) => Some(self.create_write_path(
                out.as_os_str().as_bytes(),
                image.path.as_bytes(),
                true,
                Some(TBD_EXTENSION),
            )?),
            None => None,
        };

        self.emit(&info, Path::new(&image.path), destination)
    }
}
