//! Cooperative pause via a lock file.
//!
//! Another process can suspend forwarding by creating the lock file and
//! resume it by removing the file. The parent directory is watched with
//! inotify so the event loop wakes up as soon as the file appears or goes
//! away. The watch is best-effort: without it the loop still notices on
//! its next timeout.

use nix::sys::inotify::{AddWatchFlags, InitFlags, Inotify};
use std::os::fd::{AsFd, BorrowedFd};
use std::path::{Path, PathBuf};
use tracing::{debug, info, warn};

/// Default lock file location.
pub const DEFAULT_LOCK_FILE: &str = "/run/clat/pause.lock";

pub struct PauseWatcher {
    path: PathBuf,
    inotify: Option<Inotify>,
    paused: bool,
}

impl PauseWatcher {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let inotify = match Self::watch(&path) {
            Ok(inotify) => Some(inotify),
            Err(e) => {
                warn!(path = %path.display(), error = %e, "Lock file watch unavailable");
                None
            }
        };
        Self {
            path,
            inotify,
            paused: false,
        }
    }

    fn watch(path: &Path) -> nix::Result<Inotify> {
        let dir = match path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let inotify = Inotify::init(InitFlags::IN_NONBLOCK | InitFlags::IN_CLOEXEC)?;
        inotify.add_watch(
            dir,
            AddWatchFlags::IN_CREATE
                | AddWatchFlags::IN_DELETE
                | AddWatchFlags::IN_MOVED_TO
                | AddWatchFlags::IN_MOVED_FROM,
        )?;
        debug!(dir = %dir.display(), "Watching lock file directory");
        Ok(inotify)
    }

    /// Look at the lock file again and return whether forwarding is
    /// suspended. Transitions are logged.
    pub fn refresh(&mut self) -> bool {
        let paused = self.path.exists();
        if paused != self.paused {
            if paused {
                info!(lock_file = %self.path.display(), "Forwarding paused");
            } else {
                info!(lock_file = %self.path.display(), "Forwarding resumed");
            }
            self.paused = paused;
        }
        paused
    }

    /// Descriptor that becomes readable when the directory changes.
    pub fn fd(&self) -> Option<BorrowedFd<'_>> {
        self.inotify.as_ref().map(|inotify| inotify.as_fd())
    }

    /// Discard pending notifications.
    pub fn drain(&self) {
        let Some(inotify) = &self.inotify else {
            return;
        };
        while let Ok(events) = inotify.read_events() {
            if events.is_empty() {
                break;
            }
        }
    }
}
