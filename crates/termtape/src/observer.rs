//! Named-pipe event stream for external observers. The concrete adapter
//! that *reads* the pipe is out of scope for the core (spec.md §1); this
//! only owns the tee point and the stable event-line format so such an
//! adapter has something real to read.

use std::io::Write as _;
use std::path::Path;
use std::path::PathBuf;

/// `TAG` values in `[<unix_ts>.<ms>][<TAG>] <payload>` event lines.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventTag {
    /// Session lifecycle metadata (construction, mode switches, close).
    Mtx,
    In,
    Out,
    Err,
}

impl EventTag {
    fn as_str(self) -> &'static str {
        match self {
            EventTag::Mtx => "MTX",
            EventTag::In => "IN",
            EventTag::Out => "OUT",
            EventTag::Err => "ERR",
        }
    }
}

pub struct ObserverPipe {
    path: PathBuf,
    #[cfg(unix)]
    file: std::fs::File,
}

impl ObserverPipe {
    /// Create (if needed) and open the named pipe at `path` for non-blocking
    /// read/write, so the writer never blocks on an absent reader.
    #[cfg(unix)]
    pub fn open(path: &Path) -> std::io::Result<Self> {
        use std::os::unix::ffi::OsStrExt;

        if !path.exists() {
            let c_path = std::ffi::CString::new(path.as_os_str().as_bytes())
                .map_err(|e| std::io::Error::new(std::io::ErrorKind::InvalidInput, e))?;
            // SAFETY: c_path is a valid NUL-terminated string for the
            // lifetime of this call; mkfifo only touches the filesystem
            // entry it names.
            let rc = unsafe { libc::mkfifo(c_path.as_ptr(), 0o600) };
            if rc != 0 && std::io::Error::last_os_error().kind() != std::io::ErrorKind::AlreadyExists {
                return Err(std::io::Error::last_os_error());
            }
        }
        use std::os::unix::fs::OpenOptionsExt;
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(path)?;
        Ok(Self {
            path: path.to_path_buf(),
            file,
        })
    }

    #[cfg(not(unix))]
    pub fn open(path: &Path) -> std::io::Result<Self> {
        Ok(Self {
            path: path.to_path_buf(),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Write one tagged event line. Best-effort: a full pipe with no
    /// reader is silently dropped rather than blocking the session.
    pub fn write_event(&mut self, tag: EventTag, payload: &str) {
        let now = chrono::Utc::now();
        let line = format!(
            "[{}.{:03}][{}] {}\n",
            now.timestamp(),
            now.timestamp_subsec_millis(),
            tag.as_str(),
            payload
        );
        #[cfg(unix)]
        {
            let _ = self.file.write_all(line.as_bytes());
        }
        #[cfg(not(unix))]
        {
            let _ = line;
        }
    }
}

impl Drop for ObserverPipe {
    fn drop(&mut self) {
        let _ = std::fs::remove_file(&self.path);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;

    #[test]
    fn write_event_formats_tag_and_payload() {
        let dir = tempfile::tempdir().expect("tmpdir");
        let path = dir.path().join("events.pipe");
        let mut pipe = ObserverPipe::open(&path).expect("open pipe");
        pipe.write_event(EventTag::Out, "hello");
        assert!(path.exists());
    }
}
