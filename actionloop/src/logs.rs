//! Activation log sinks.
//!
//! A [`LogSink`] is a shared append-only destination for a user function's
//! stdout or stderr. The child process writes to it directly (via a cloned
//! handle), the pipelines append whole records under a mutex, and the
//! server-side worker reads back the byte range a single activation
//! produced so it can ship the logs to the client in the run envelope.

#![allow(unsafe_code)]

use std::fs::File;
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::os::fd::FromRawFd;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::{Arc, Mutex};

use actionloop_proto::ACTIVATION_GUARD;

/// Shared append-only log destination.
///
/// Cheap to clone; all clones append to the same file. Appends are atomic
/// at record granularity (one lock per record).
#[derive(Debug, Clone)]
pub struct LogSink {
    inner: Arc<Inner>,
}

#[derive(Debug)]
struct Inner {
    /// Write handle; the child's stdio handles are clones of this.
    file: Mutex<File>,
    /// Path for offset-based capture; `None` for process stdio sinks.
    path: Option<PathBuf>,
    /// Keeps temp-backed sinks alive until the sink is dropped.
    _temp: Option<tempfile::TempPath>,
}

impl LogSink {
    /// A sink that appends to the runtime's own stdout.
    pub fn stdout() -> io::Result<Self> {
        Ok(Self::from_parts(dup_fd(libc::STDOUT_FILENO)?, None, None))
    }

    /// A sink that appends to the runtime's own stderr.
    pub fn stderr() -> io::Result<Self> {
        Ok(Self::from_parts(dup_fd(libc::STDERR_FILENO)?, None, None))
    }

    /// A sink appending to the file at `path` (created if missing).
    ///
    /// Capture is available for this sink.
    pub fn file(path: impl AsRef<Path>) -> io::Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = File::options().append(true).create(true).open(&path)?;
        Ok(Self::from_parts(file, Some(path), None))
    }

    /// A sink backed by a fresh temp file, removed when the sink is dropped.
    ///
    /// Used for the per-action logs of multiplexed server entries.
    pub fn temp() -> io::Result<Self> {
        let (file, path) = tempfile::NamedTempFile::new()?.into_parts();
        Ok(Self::from_parts(file, Some(path.to_path_buf()), Some(path)))
    }

    fn from_parts(file: File, path: Option<PathBuf>, temp: Option<tempfile::TempPath>) -> Self {
        Self {
            inner: Arc::new(Inner {
                file: Mutex::new(file),
                path,
                _temp: temp,
            }),
        }
    }

    /// Appends one record under the sink lock.
    pub fn write_record(&self, record: &[u8]) -> io::Result<()> {
        let mut file = self.lock();
        file.write_all(record)?;
        file.flush()
    }

    /// Appends `line` followed by a newline.
    pub fn write_line(&self, line: &str) -> io::Result<()> {
        let mut record = Vec::with_capacity(line.len() + 1);
        record.extend_from_slice(line.as_bytes());
        record.push(b'\n');
        self.write_record(&record)
    }

    /// Appends the activation sentinel. Best-effort: a full disk must not
    /// take the runtime down with it.
    pub fn append_guard(&self) {
        if let Err(e) = self.write_line(ACTIVATION_GUARD) {
            tracing::debug!("failed to write activation sentinel: {e}");
        }
    }

    /// Current length in bytes, used as the capture start offset.
    pub fn len(&self) -> io::Result<u64> {
        Ok(self.lock().metadata()?.len())
    }

    /// `true` when nothing has been appended yet.
    pub fn is_empty(&self) -> io::Result<bool> {
        Ok(self.len()? == 0)
    }

    /// Reads everything appended since `offset`.
    ///
    /// Returns an empty string for sinks without a backing path (process
    /// stdio); those logs are already where the operator wants them.
    pub fn capture_from(&self, offset: u64) -> io::Result<String> {
        let Some(path) = &self.inner.path else {
            return Ok(String::new());
        };
        let mut file = File::open(path)?;
        file.seek(SeekFrom::Start(offset))?;
        let mut buf = Vec::new();
        file.read_to_end(&mut buf)?;
        Ok(String::from_utf8_lossy(&buf).into_owned())
    }

    /// A stdio handle for wiring the sink as a child's stdout or stderr.
    pub fn child_stdio(&self) -> io::Result<Stdio> {
        Ok(Stdio::from(self.lock().try_clone()?))
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, File> {
        // A poisoned log lock only means another thread died mid-append;
        // the file itself is still usable.
        self.inner
            .file
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
    }
}

/// Duplicates a process stdio descriptor into an owned [`File`].
fn dup_fd(fd: libc::c_int) -> io::Result<File> {
    // SAFETY: dup(2) on a standard descriptor; a non-negative return value
    // is a fresh fd this File takes sole ownership of.
    let dup = unsafe { libc::dup(fd) };
    if dup < 0 {
        return Err(io::Error::last_os_error());
    }
    // SAFETY: dup is a valid fd owned by no one else.
    Ok(unsafe { File::from_raw_fd(dup) })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn records_append_in_order() {
        let sink = LogSink::temp().unwrap();
        sink.write_line("one").unwrap();
        sink.write_line("two").unwrap();
        assert_eq!(sink.capture_from(0).unwrap(), "one\ntwo\n");
    }

    #[test]
    fn capture_from_offset_sees_only_new_content() {
        let sink = LogSink::temp().unwrap();
        sink.write_line("before").unwrap();
        let mark = sink.len().unwrap();
        sink.write_line("after").unwrap();
        sink.append_guard();
        assert_eq!(
            sink.capture_from(mark).unwrap(),
            format!("after\n{ACTIVATION_GUARD}\n")
        );
    }

    #[test]
    fn clones_share_the_backing_file() {
        let sink = LogSink::temp().unwrap();
        let clone = sink.clone();
        sink.write_line("a").unwrap();
        clone.write_line("b").unwrap();
        assert_eq!(sink.capture_from(0).unwrap(), "a\nb\n");
    }

    #[test]
    fn file_sink_captures_across_reopen() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("out.log");
        let sink = LogSink::file(&path).unwrap();
        sink.write_line("hello").unwrap();
        assert_eq!(sink.capture_from(0).unwrap(), "hello\n");
        assert!(path.exists());
    }
}
