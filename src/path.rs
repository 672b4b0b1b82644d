//! Path algebra over raw byte strings.
//!
//! Paths are handled as `&[u8]` so that they can be sliced, compared and
//! joined without first validating UTF-8 or building a component list. A run
//! of consecutive `/` characters (a "slash-run") always acts as a single
//! separator, so `/a/b` and `/a//b` are indistinguishable here. No
//! canonicalization of `.` or `..` is performed.
//!
//! Functions that locate something return indices into the slice they were
//! given; functions that build a new path return a [`PathBuffer`].

use std::borrow::Cow;
use std::cell::OnceCell;
use std::ffi::{CStr, OsStr};
use std::fmt;
use std::os::unix::ffi::{OsStrExt, OsStringExt};
use std::path::Path;

use crate::error::{Error, Result};

#[inline(always)]
fn is_slash(ch: u8) -> bool {
    ch == b'/'
}

// =============================================================================
// Path Buffer
// =============================================================================

/// A heap-owned, NUL-terminated path.
///
/// The trailing NUL is never part of [`as_bytes`](Self::as_bytes). The
/// materialization routines in [`crate::recursive`] temporarily overwrite a
/// separator with NUL through [`Truncation`], which puts the byte back when
/// dropped.
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct PathBuffer {
    bytes: Vec<u8>,
}

impl PathBuffer {
    /// Creates a buffer holding a copy of `path`.
    ///
    /// Fails with [`Error::InteriorNul`] if `path` contains a NUL byte.
    pub fn from_bytes(path: &[u8]) -> Result<Self> {
        Self::from_parts(&[path])
    }

    /// Creates a buffer from a filesystem path.
    pub fn from_path(path: &Path) -> Result<Self> {
        Self::from_bytes(path.as_os_str().as_bytes())
    }

    /// Concatenates `parts` into one exactly-sized allocation.
    fn from_parts(parts: &[&[u8]]) -> Result<Self> {
        let len: usize = parts.iter().map(|p| p.len()).sum();
        let mut bytes = Vec::with_capacity(len + 1);
        for part in parts {
            bytes.extend_from_slice(part);
        }
        if memchr::memchr(0, &bytes).is_some() {
            return Err(Error::InteriorNul(
                String::from_utf8_lossy(&bytes).into_owned(),
            ));
        }
        bytes.push(0);
        Ok(Self { bytes })
    }

    /// Returns the path without its terminator.
    #[inline]
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes[..self.bytes.len() - 1]
    }

    /// Returns the path including its terminator.
    #[inline]
    pub fn as_c_str(&self) -> &CStr {
        // SAFETY: construction guarantees exactly one NUL, at the end, and
        // every truncation restores the byte it overwrote before it is dropped.
        unsafe { CStr::from_bytes_with_nul_unchecked(&self.bytes) }
    }

    /// Returns the path as a [`Path`].
    #[inline]
    pub fn as_path(&self) -> &Path {
        Path::new(OsStr::from_bytes(self.as_bytes()))
    }

    /// Returns the length of the path, not counting the terminator.
    #[inline]
    pub fn len(&self) -> usize {
        self.bytes.len() - 1
    }

    /// Returns true if the path is empty.
    #[inline]
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Consumes the buffer, returning the path bytes without the terminator.
    pub fn into_bytes(mut self) -> Vec<u8> {
        self.bytes.pop();
        self.bytes
    }

    /// Temporarily ends the string at `at`.
    ///
    /// The byte at `at` is replaced with NUL until the returned guard is
    /// dropped.
    ///
    /// # Panics
    ///
    /// Panics if `at >= self.len()`.
    pub(crate) fn truncate_at(&mut self, at: usize) -> Truncation<'_> {
        assert!(at < self.len(), "truncation point {at} past end of path");
        let saved = std::mem::replace(&mut self.bytes[at], 0);
        Truncation {
            buffer: self,
            at,
            saved,
        }
    }
}

impl fmt::Debug for PathBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PathBuffer({:?})", String::from_utf8_lossy(self.as_bytes()))
    }
}

impl fmt::Display for PathBuffer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&String::from_utf8_lossy(self.as_bytes()))
    }
}

/// A [`PathBuffer`] cut short at one position.
///
/// Dropping the guard writes the original byte back, so the buffer is whole
/// again on every exit path.
pub(crate) struct Truncation<'a> {
    buffer: &'a mut PathBuffer,
    at: usize,
    saved: u8,
}

impl Truncation<'_> {
    /// Returns the truncated path.
    #[inline]
    pub(crate) fn as_c_str(&self) -> &CStr {
        // SAFETY: `at` holds the NUL we wrote and `at` precedes the original
        // terminator, so `..=at` ends with the first NUL in the buffer.
        unsafe { CStr::from_bytes_with_nul_unchecked(&self.buffer.bytes[..=self.at]) }
    }
}

impl Drop for Truncation<'_> {
    fn drop(&mut self) {
        self.buffer.bytes[self.at] = self.saved;
    }
}

// =============================================================================
// Working Directory
// =============================================================================

/// The process working directory, fetched on first use and then cached.
///
/// The cache is never refreshed. The tool never changes directory, so the
/// first answer stays valid for the whole run.
#[derive(Debug, Default)]
pub struct WorkingDirectory {
    cached: OnceCell<Vec<u8>>,
}

impl WorkingDirectory {
    /// Creates an empty cache; the directory is fetched on first use.
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a cache that is already filled with `path`.
    pub fn with_path(path: &[u8]) -> Self {
        let cached = OnceCell::new();
        let _ = cached.set(path.to_vec());
        Self { cached }
    }

    /// Returns the working directory, fetching it if this is the first call.
    pub fn get(&self) -> Result<&[u8]> {
        if let Some(cwd) = self.cached.get() {
            return Ok(cwd);
        }

        let cwd = std::env::current_dir()
            .map_err(Error::WorkingDirectoryUnavailable)?
            .into_os_string()
            .into_vec();

        Ok(self.cached.get_or_init(|| cwd))
    }

    /// Returns `path` as an absolute path.
    ///
    /// Absolute paths come back borrowed. Relative ones are appended to the
    /// working directory.
    pub fn resolve<'p>(&self, path: &'p [u8]) -> Result<Cow<'p, [u8]>> {
        if path.first().copied().is_some_and(is_slash) {
            return Ok(Cow::Borrowed(path));
        }

        let cwd = self.get()?;
        let joined = if trimmed_len(cwd) == 0 {
            // Running from `/`: joining onto the empty trimmed base would drop
            // the root.
            match strip_leading_slashes(path) {
                Some(component) => PathBuffer::from_parts(&[b"/", component])?,
                None => PathBuffer::from_bytes(b"/")?,
            }
        } else {
            append_component(cwd, path)?
        };

        Ok(Cow::Owned(joined.into_bytes()))
    }
}

// =============================================================================
// Slash-Run Navigation
// =============================================================================

/// Returns the index one past the slash-run starting at `at`.
///
/// Returns `None` if the run extends to the end of the string, i.e. nothing
/// follows it. If `path[at]` is not a slash, `at` itself is returned.
pub fn end_of_slash_run(path: &[u8], at: usize) -> Option<usize> {
    let mut iter = at;
    while iter < path.len() && is_slash(path[iter]) {
        iter += 1;
    }

    if iter == path.len() {
        None
    } else {
        Some(iter)
    }
}

/// Returns the index of the first slash of the run containing `at`.
pub fn front_of_slash_run(path: &[u8], at: usize) -> usize {
    let mut iter = at;
    while iter > 0 && is_slash(path[iter - 1]) {
        iter -= 1;
    }
    iter
}

/// Returns the index of the last slash of the run containing `at`.
pub fn back_of_slash_run(path: &[u8], at: usize) -> usize {
    let mut iter = at;
    while iter + 1 < path.len() && is_slash(path[iter + 1]) {
        iter += 1;
    }
    iter
}

/// Returns the index of the first non-slash character strictly before `at`.
///
/// Any slash-run immediately before `at` is skipped. Returns `None` if only
/// slashes (or nothing) precede `at`.
pub fn before_slash_run(path: &[u8], at: usize) -> Option<usize> {
    path[..at].iter().rposition(|&ch| !is_slash(ch))
}

/// Returns the front of the last slash-run in `path`.
pub fn last_slash_run(path: &[u8]) -> Option<usize> {
    last_slash_run_before(path, path.len())
}

/// Returns the front of the last slash-run that starts before `end`.
pub fn last_slash_run_before(path: &[u8], end: usize) -> Option<usize> {
    let back = memchr::memrchr(b'/', &path[..end])?;
    Some(front_of_slash_run(path, back))
}

/// Returns the index of the very last slash in `path`.
pub fn back_of_last_slash_run(path: &[u8]) -> Option<usize> {
    memchr::memrchr(b'/', path)
}

/// Returns the front of the slash-run that ends `path`, if it ends in one.
pub fn ending_slash_run(path: &[u8]) -> Option<usize> {
    let &back = path.last()?;
    if !is_slash(back) {
        return None;
    }
    Some(front_of_slash_run(path, path.len() - 1))
}

/// Returns the length of `path` once any trailing slash-run is ignored.
#[inline]
pub fn trimmed_len(path: &[u8]) -> usize {
    ending_slash_run(path).unwrap_or(path.len())
}

/// Returns `component` without its leading slash-run.
///
/// Returns `None` if `component` is made of slashes only.
#[inline]
fn strip_leading_slashes(component: &[u8]) -> Option<&[u8]> {
    match component.first() {
        Some(&ch) if is_slash(ch) => end_of_slash_run(component, 0).map(|i| &component[i..]),
        _ => Some(component),
    }
}

// =============================================================================
// Joining
// =============================================================================

/// Joins `component` onto `path` with exactly one separator between them.
///
/// A trailing slash-run on `path` and a leading slash-run on `component` are
/// dropped. If `component` is only slashes the result is the trimmed `path`;
/// if the trimmed `path` is empty the result is the stripped `component`.
///
/// Fails with [`Error::InteriorNul`] if either part contains a NUL byte.
pub fn append_component(path: &[u8], component: &[u8]) -> Result<PathBuffer> {
    append_component_and_extension(path, component, None)
}

/// Joins `component` onto `path` and adds `.extension`.
///
/// Any number of leading dots on `extension` collapse to exactly one. An
/// extension that is empty or made only of dots adds nothing.
pub fn append_component_and_extension(
    path: &[u8],
    component: &[u8],
    extension: Option<&[u8]>,
) -> Result<PathBuffer> {
    let path = &path[..trimmed_len(path)];
    let Some(component) = strip_leading_slashes(component) else {
        return PathBuffer::from_bytes(path);
    };

    let extension = extension
        .and_then(|ext| ext.iter().position(|&ch| ch != b'.').map(|i| &ext[i..]));

    match (path.is_empty(), extension) {
        (true, None) => PathBuffer::from_bytes(component),
        (true, Some(ext)) => PathBuffer::from_parts(&[component, b".", ext]),
        (false, None) => PathBuffer::from_parts(&[path, b"/", component]),
        (false, Some(ext)) => PathBuffer::from_parts(&[path, b"/", component, b".", ext]),
    }
}

// =============================================================================
// Component Queries
// =============================================================================

/// Returns the final component of `path`, ignoring a trailing slash-run.
///
/// Returns `None` if `path` is empty or made of slashes only.
pub fn last_component(path: &[u8]) -> Option<&[u8]> {
    let end = match ending_slash_run(path) {
        Some(0) => return None,
        Some(front) => front,
        None if path.is_empty() => return None,
        None => path.len(),
    };

    let begin = match last_slash_run_before(path, end) {
        Some(front) => end_of_slash_run(path, front)?,
        None => 0,
    };

    Some(&path[begin..end])
}

/// Returns true if `component` is one of the components of `path`.
///
/// Without `allow_in_hierarchy` only the final component can match; with it,
/// a match anywhere in the path counts. The query `/` matches any path that
/// starts with a slash.
pub fn has_component(path: &[u8], component: &[u8], allow_in_hierarchy: bool) -> bool {
    let starts_with_slash = path.first().copied().is_some_and(is_slash);
    if component == b"/" && starts_with_slash {
        return true;
    }

    let mut begin = 0;
    if starts_with_slash {
        match end_of_slash_run(path, 0) {
            Some(after) => begin = after,
            None => return component.first().copied().is_some_and(is_slash),
        }
    } else if path.is_empty() {
        return false;
    }

    loop {
        let end = memchr::memchr(b'/', &path[begin..]).map_or(path.len(), |i| begin + i);
        let next = if end == path.len() {
            None
        } else {
            end_of_slash_run(path, end)
        };

        if &path[begin..end] == component && (next.is_none() || allow_in_hierarchy) {
            return true;
        }

        match next {
            Some(after) => begin = after,
            None => return false,
        }
    }
}

/// Returns the index just past the dot that starts the extension of `path`.
///
/// The last `.` in `path` is used. It does not start an extension if it is
/// the first character of `path` or of its component (a hidden file).
pub fn find_extension(path: &[u8]) -> Option<usize> {
    let dot = memchr::memrchr(b'.', path)?;
    if dot == 0 || is_slash(path[dot - 1]) {
        return None;
    }
    Some(dot + 1)
}
