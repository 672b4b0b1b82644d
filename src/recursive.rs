//! Create-if-missing file and directory materialization.
//!
//! [`open_r`] and [`mkdir_r`] behave like `open(O_CREAT)` and `mkdir`, except
//! that missing ancestor directories are created on demand. [`remove_partial_r`]
//! undoes that work after a later failure.
//!
//! All three operate on one [`PathBuffer`]. To create an ancestor, the
//! separator that ends it is overwritten with NUL for the duration of a single
//! syscall and then put back, so no intermediate strings are allocated. On
//! return the buffer always holds its original contents.
//!
//! Error policy:
//! - `EEXIST` while creating a directory is success.
//! - `ENOENT` triggers ancestor creation, followed by exactly one retry.
//! - Any other error is returned as-is, with the OS error code intact.
//!
//! This module does not log; reporting is left to the caller.

use std::ffi::CStr;
use std::fs::File;
use std::io;
use std::os::fd::FromRawFd;

use bitflags::bitflags;

use crate::path::{end_of_slash_run, ending_slash_run, last_slash_run, last_slash_run_before};
use crate::path::{trimmed_len, PathBuffer};

bitflags! {
    /// Flags passed to `open` alongside `O_CREAT`.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct OpenFlags: libc::c_int {
        /// Open for writing only
        const WRITE_ONLY = libc::O_WRONLY;
        /// Open for reading and writing
        const READ_WRITE = libc::O_RDWR;
        /// Truncate an existing file
        const TRUNCATE = libc::O_TRUNC;
        /// Fail with `EEXIST` if the file already exists
        const EXCLUSIVE = libc::O_EXCL;
    }
}

/// Position of the separator that ends the shallowest directory created by
/// [`open_r`] or [`mkdir_r`].
///
/// Everything at or below `buffer[..position]` was created by that call. Pass
/// it to [`remove_partial_r`] to undo the creation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct Terminator(usize);

impl Terminator {
    /// Returns the index of the separator within the path buffer.
    #[inline]
    pub fn position(self) -> usize {
        self.0
    }
}

// =============================================================================
// Syscalls
// =============================================================================

#[inline]
fn is_missing(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::ENOENT)
}

#[inline]
fn is_existing(err: &io::Error) -> bool {
    err.raw_os_error() == Some(libc::EEXIST)
}

#[inline]
fn missing() -> io::Error {
    io::Error::from_raw_os_error(libc::ENOENT)
}

fn sys_mkdir(path: &CStr, mode: u32) -> io::Result<()> {
    // SAFETY: `path` is NUL-terminated and outlives the call.
    if unsafe { libc::mkdir(path.as_ptr(), mode as libc::mode_t) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

fn sys_open(path: &CStr, flags: OpenFlags, mode: u32) -> io::Result<File> {
    let flags = libc::O_CREAT | libc::O_CLOEXEC | flags.bits();
    // SAFETY: `path` is NUL-terminated and outlives the call.
    let fd = unsafe { libc::open(path.as_ptr(), flags, mode as libc::c_uint) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: `fd` was just returned by a successful `open` and is owned by no one else.
    Ok(unsafe { File::from_raw_fd(fd) })
}

fn sys_remove(path: &CStr) -> io::Result<()> {
    // SAFETY: `path` is NUL-terminated and outlives the call.
    if unsafe { libc::remove(path.as_ptr()) } == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

/// Runs `mkdir` on `buffer[..at]`.
fn mkdir_at(buffer: &mut PathBuffer, at: usize, mode: u32) -> io::Result<()> {
    let cut = buffer.truncate_at(at);
    sys_mkdir(cut.as_c_str(), mode)
}

/// Runs `remove` on `buffer[..at]`.
fn remove_at(buffer: &mut PathBuffer, at: usize) -> io::Result<()> {
    let cut = buffer.truncate_at(at);
    sys_remove(cut.as_c_str())
}

/// Returns the front of the first slash-run after the one at `at`.
fn next_slash_run(path: &[u8], at: usize) -> Option<usize> {
    let component = end_of_slash_run(path, at)?;
    memchr::memchr(b'/', &path[component..]).map(|i| component + i)
}

// =============================================================================
// Ancestor Creation
// =============================================================================

/// Creates every missing directory above the final component of `buffer`.
///
/// Walks backward from the parent of the final component, truncating at each
/// slash-run and trying `mkdir`, until one succeeds or already exists. Then
/// walks forward again, creating each directory that the backward walk found
/// missing.
///
/// Returns the separator ending the shallowest directory this call created,
/// or `None` if every ancestor already existed.
pub fn create_ancestors(buffer: &mut PathBuffer, mode: u32) -> io::Result<Option<Terminator>> {
    let mut cut = last_slash_run(buffer.as_bytes()).ok_or_else(missing)?;

    if ending_slash_run(buffer.as_bytes()) == Some(cut) {
        // The trailing run does not separate anything. Create the path
        // without it, then continue from the run before the final component.
        match mkdir_at(buffer, cut, mode) {
            Ok(()) => return Ok(Some(Terminator(cut))),
            Err(e) if is_existing(&e) => return Ok(None),
            Err(e) if !is_missing(&e) => return Err(e),
            Err(_) => {}
        }
        cut = last_slash_run_before(buffer.as_bytes(), cut).ok_or_else(missing)?;
    }

    let final_cut = cut;
    let mut created = None;

    // Backward probe. A cut at 0 is the root of an absolute path, which
    // always exists.
    while cut != 0 {
        match mkdir_at(buffer, cut, mode) {
            Ok(()) => {
                created = Some(cut);
                break;
            }
            Err(e) if is_existing(&e) => break,
            Err(e) if is_missing(&e) => {
                cut = last_slash_run_before(buffer.as_bytes(), cut).ok_or(e)?;
            }
            Err(e) => return Err(e),
        }
    }

    // Forward creation, up to and including the parent of the final component.
    while cut != final_cut {
        cut = next_slash_run(buffer.as_bytes(), cut).ok_or_else(missing)?;
        match mkdir_at(buffer, cut, mode) {
            Ok(()) => {
                created.get_or_insert(cut);
            }
            Err(e) if is_existing(&e) => {}
            Err(e) => return Err(e),
        }
    }

    Ok(created.map(Terminator))
}

// =============================================================================
// Entry Points
// =============================================================================

/// Opens `buffer` with `O_CREAT | flags`, creating missing ancestors.
///
/// Returns the file and, if any directories had to be created, the
/// [`Terminator`] needed to roll them back.
pub fn open_r(
    buffer: &mut PathBuffer,
    flags: OpenFlags,
    mode: u32,
    dir_mode: u32,
) -> io::Result<(File, Option<Terminator>)> {
    match sys_open(buffer.as_c_str(), flags, mode) {
        Ok(file) => return Ok((file, None)),
        Err(e) if !is_missing(&e) => return Err(e),
        Err(_) => {}
    }

    let terminator = create_ancestors(buffer, dir_mode)?;
    let file = sys_open(buffer.as_c_str(), flags, mode)?;

    Ok((file, terminator))
}

/// Creates the directory `buffer`, creating missing ancestors.
///
/// An existing directory counts as success, so calling this twice is fine.
pub fn mkdir_r(buffer: &mut PathBuffer, mode: u32) -> io::Result<Option<Terminator>> {
    match sys_mkdir(buffer.as_c_str(), mode) {
        Ok(()) => return Ok(None),
        Err(e) if is_existing(&e) => return Ok(None),
        Err(e) if !is_missing(&e) => return Err(e),
        Err(_) => {}
    }

    let terminator = create_ancestors(buffer, mode)?;
    match sys_mkdir(buffer.as_c_str(), mode) {
        Ok(()) => Ok(terminator),
        Err(e) if is_existing(&e) => Ok(terminator),
        Err(e) => Err(e),
    }
}

/// Removes `buffer`, then the directories created above it.
///
/// `from` is the marker returned when `buffer` was created. Directories are
/// removed deepest first, down to and including the one ending at `from`.
/// Failing to remove the leaf is an error; failing to remove a directory
/// (for example because something else was written into it) stops the
/// rollback quietly.
///
/// Returns the number of directories removed.
pub fn remove_partial_r(buffer: &mut PathBuffer, from: Option<Terminator>) -> io::Result<usize> {
    sys_remove(buffer.as_c_str())?;

    let Some(Terminator(from)) = from else {
        return Ok(0);
    };

    let end = trimmed_len(buffer.as_bytes());
    let mut cut = last_slash_run_before(buffer.as_bytes(), end);
    let mut removed = 0;

    while let Some(at) = cut {
        if at == 0 || at < from {
            break;
        }
        if remove_at(buffer, at).is_err() {
            break;
        }
        removed += 1;
        cut = last_slash_run_before(buffer.as_bytes(), at);
    }

    Ok(removed)
}

#[cfg(test)]
mod tests {
    use super::*;

    use std::io::Write;
    use std::os::unix::ffi::OsStrExt;
    use std::path::Path;

    fn buffer_for(path: &Path) -> PathBuffer {
        PathBuffer::from_bytes(path.as_os_str().as_bytes()).unwrap()
    }

    #[test]
    fn test_open_r_creates_missing_ancestors() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("x/y/z/file");
        let mut buffer = buffer_for(&target);
        let original = buffer.clone();

        let (mut file, terminator) = open_r(
            &mut buffer,
            OpenFlags::WRITE_ONLY | OpenFlags::TRUNCATE,
            0o644,
            0o755,
        )
        .unwrap();
        file.write_all(b"hello").unwrap();

        assert_eq!(buffer, original);
        assert!(tmp.path().join("x/y/z").is_dir());
        assert_eq!(std::fs::read(&target).unwrap(), b"hello");

        // The shallowest directory created is `x`.
        let terminator = terminator.unwrap();
        let created = &buffer.as_bytes()[..terminator.position()];
        assert_eq!(created, tmp.path().join("x").as_os_str().as_bytes());
    }

    #[test]
    fn test_open_r_existing_parent_needs_no_rollback() {
        let tmp = tempfile::tempdir().unwrap();
        let mut buffer = buffer_for(&tmp.path().join("file"));

        let (_, terminator) = open_r(&mut buffer, OpenFlags::WRITE_ONLY, 0o644, 0o755).unwrap();
        assert_eq!(terminator, None);
    }

    #[test]
    fn test_open_r_with_redundant_slashes() {
        let tmp = tempfile::tempdir().unwrap();
        let mut raw = tmp.path().as_os_str().as_bytes().to_vec();
        raw.extend_from_slice(b"//a///b//file");
        let mut buffer = PathBuffer::from_bytes(&raw).unwrap();

        open_r(&mut buffer, OpenFlags::WRITE_ONLY, 0o644, 0o755).unwrap();
        assert_eq!(buffer.as_bytes(), raw.as_slice());
        assert!(tmp.path().join("a/b/file").is_file());
    }

    #[test]
    fn test_open_r_exclusive_reports_existing() {
        let tmp = tempfile::tempdir().unwrap();
        let target = tmp.path().join("file");
        std::fs::write(&target, b"old").unwrap();
        let mut buffer = buffer_for(&target);

        let err = open_r(
            &mut buffer,
            OpenFlags::WRITE_ONLY | OpenFlags::EXCLUSIVE,
            0o644,
            0o755,
        )
        .unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::EEXIST));
        assert_eq!(std::fs::read(&target).unwrap(), b"old");
    }

    #[test]
    fn test_hard_errors_propagate_and_restore_buffer() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::write(tmp.path().join("blocker"), b"").unwrap();
        let mut buffer = buffer_for(&tmp.path().join("blocker/a/b/file"));
        let original = buffer.clone();

        let err = open_r(&mut buffer, OpenFlags::WRITE_ONLY, 0o644, 0o755).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOTDIR));
        assert_eq!(buffer, original);

        let err = mkdir_r(&mut buffer, 0o755).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOTDIR));
        assert_eq!(buffer, original);
    }

    #[test]
    fn test_mkdir_r_is_idempotent() {
        let tmp = tempfile::tempdir().unwrap();
        let mut buffer = buffer_for(&tmp.path().join("a/b/c"));
        let original = buffer.clone();

        let first = mkdir_r(&mut buffer, 0o755).unwrap();
        assert!(first.is_some());
        assert!(tmp.path().join("a/b/c").is_dir());

        let second = mkdir_r(&mut buffer, 0o755).unwrap();
        assert_eq!(second, None);
        assert_eq!(buffer, original);
    }

    #[test]
    fn test_mkdir_r_trailing_slashes() {
        let tmp = tempfile::tempdir().unwrap();
        let mut raw = tmp.path().as_os_str().as_bytes().to_vec();
        raw.extend_from_slice(b"/a/b/c//");
        let mut buffer = PathBuffer::from_bytes(&raw).unwrap();

        mkdir_r(&mut buffer, 0o755).unwrap();
        assert_eq!(buffer.as_bytes(), raw.as_slice());
        assert!(tmp.path().join("a/b/c").is_dir());
    }

    #[test]
    fn test_create_ancestors_when_parent_exists() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(tmp.path().join("a/b")).unwrap();
        let mut buffer = buffer_for(&tmp.path().join("a/b/file"));

        assert_eq!(create_ancestors(&mut buffer, 0o755).unwrap(), None);
    }

    #[test]
    fn test_remove_partial_r_rolls_back_created_tree() {
        let tmp = tempfile::tempdir().unwrap();
        let mut buffer = buffer_for(&tmp.path().join("x/y/z/file"));

        let (file, terminator) = open_r(&mut buffer, OpenFlags::WRITE_ONLY, 0o644, 0o755).unwrap();
        drop(file);

        let removed = remove_partial_r(&mut buffer, terminator).unwrap();
        assert_eq!(removed, 3);
        assert!(!tmp.path().join("x").exists());
        assert!(tmp.path().exists());
    }

    #[test]
    fn test_remove_partial_r_keeps_preexisting_directories() {
        let tmp = tempfile::tempdir().unwrap();
        std::fs::create_dir(tmp.path().join("keep")).unwrap();
        let mut buffer = buffer_for(&tmp.path().join("keep/new/file"));

        let (_, terminator) = open_r(&mut buffer, OpenFlags::WRITE_ONLY, 0o644, 0o755).unwrap();
        let removed = remove_partial_r(&mut buffer, terminator).unwrap();

        assert_eq!(removed, 1);
        assert!(tmp.path().join("keep").is_dir());
        assert!(!tmp.path().join("keep/new").exists());
    }

    #[test]
    fn test_remove_partial_r_stops_at_non_empty_directory() {
        let tmp = tempfile::tempdir().unwrap();
        let mut buffer = buffer_for(&tmp.path().join("x/y/z/file"));

        let (_, terminator) = open_r(&mut buffer, OpenFlags::WRITE_ONLY, 0o644, 0o755).unwrap();
        std::fs::write(tmp.path().join("x/y/other"), b"").unwrap();

        let original = buffer.clone();
        let removed = remove_partial_r(&mut buffer, terminator).unwrap();
        assert_eq!(removed, 1);
        assert_eq!(buffer, original);
        assert!(!tmp.path().join("x/y/z").exists());
        assert!(tmp.path().join("x/y/other").exists());
    }

    #[test]
    fn test_remove_partial_r_missing_leaf_is_error() {
        let tmp = tempfile::tempdir().unwrap();
        let mut buffer = buffer_for(&tmp.path().join("absent"));
        let err = remove_partial_r(&mut buffer, None).unwrap_err();
        assert_eq!(err.raw_os_error(), Some(libc::ENOENT));
    }
}
