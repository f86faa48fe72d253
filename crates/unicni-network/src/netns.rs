//! Network namespace handles and scoped namespace entry.
//!
//! Namespace membership is per OS thread. The plugin runs one lifecycle event
//! per process on the main thread and never hands namespace-scoped work to
//! another thread, so a switch made by [`with_netns`] is visible exactly to
//! the code inside the closure. [`NetnsGuard`] restores the original namespace
//! when it is dropped, which also covers `?` returns and unwinding panics.

use std::fmt;
use std::fs::File;
use std::path::{Path, PathBuf};

use unicni_common::{UnicniError, UnicniResult};

/// A network namespace, named by its bind-mount path.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum Netns {
    /// The namespace the calling thread is already in (normally the host).
    #[default]
    Current,
    /// A namespace file such as `/var/run/netns/<name>` or `/proc/<pid>/ns/net`.
    Path(PathBuf),
}

impl Netns {
    /// Build a handle from a path string; the empty string means [`Netns::Current`].
    #[must_use]
    pub fn new(path: &str) -> Self {
        if path.is_empty() {
            Self::Current
        } else {
            Self::Path(PathBuf::from(path))
        }
    }

    /// Whether this is the caller's own namespace.
    #[must_use]
    pub const fn is_current(&self) -> bool {
        matches!(self, Self::Current)
    }

    /// The path to report as an interface sandbox, `None` for the host.
    #[must_use]
    pub fn sandbox(&self) -> Option<String> {
        match self {
            Self::Current => None,
            Self::Path(path) => Some(path.display().to_string()),
        }
    }

    /// Open the namespace file.
    ///
    /// # Errors
    ///
    /// Returns [`UnicniError::Namespace`] if the file cannot be opened or the
    /// handle refers to the current namespace.
    pub fn open(&self) -> UnicniResult<File> {
        match self {
            Self::Current => Err(UnicniError::Namespace {
                path: String::new(),
                message: "the current namespace has no path".to_string(),
            }),
            Self::Path(path) => File::open(path).map_err(|e| namespace_error(path, e)),
        }
    }
}

impl fmt::Display for Netns {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Current => write!(f, "host"),
            Self::Path(path) => write!(f, "{}", path.display()),
        }
    }
}

fn namespace_error(path: &Path, err: impl fmt::Display) -> UnicniError {
    UnicniError::Namespace {
        path: path.display().to_string(),
        message: err.to_string(),
    }
}

/// Run `f` with the calling thread inside `ns`.
///
/// For [`Netns::Current`] no switch happens. Otherwise the thread enters the
/// namespace, runs `f`, and is moved back before this function returns,
/// whatever `f` returned.
///
/// # Errors
///
/// Returns [`UnicniError::Namespace`] if the namespace cannot be entered, or
/// whatever `f` returns.
pub fn with_netns<T>(ns: &Netns, f: impl FnOnce() -> UnicniResult<T>) -> UnicniResult<T> {
    match ns {
        Netns::Current => f(),
        Netns::Path(path) => {
            let _guard = NetnsGuard::enter(path)?;
            f()
        }
    }
}

/// RAII guard for a thread being inside another network namespace.
#[derive(Debug)]
pub struct NetnsGuard {
    #[cfg_attr(not(target_os = "linux"), allow(dead_code))]
    original: File,
    path: PathBuf,
}

#[cfg(target_os = "linux")]
const THREAD_NETNS: &str = "/proc/thread-self/ns/net";

impl NetnsGuard {
    /// Move the calling thread into the namespace at `path`.
    ///
    /// # Errors
    ///
    /// Returns [`UnicniError::Namespace`] if either namespace file cannot be
    /// opened or the switch is refused.
    #[cfg(target_os = "linux")]
    pub fn enter(path: &Path) -> UnicniResult<Self> {
        use rustix::thread::{LinkNameSpaceType, move_into_link_name_space};
        use std::os::fd::AsFd;

        let original =
            File::open(THREAD_NETNS).map_err(|e| namespace_error(Path::new(THREAD_NETNS), e))?;
        let target = File::open(path).map_err(|e| namespace_error(path, e))?;

        move_into_link_name_space(target.as_fd(), Some(LinkNameSpaceType::Network))
            .map_err(|e| namespace_error(path, e))?;

        tracing::trace!(netns = %path.display(), "Entered network namespace");

        Ok(Self {
            original,
            path: path.to_path_buf(),
        })
    }

    /// Namespace switching is Linux-only.
    ///
    /// # Errors
    ///
    /// Always returns [`UnicniError::Unsupported`].
    #[cfg(not(target_os = "linux"))]
    pub fn enter(_path: &Path) -> UnicniResult<Self> {
        Err(UnicniError::Unsupported {
            feature: "network namespaces".to_string(),
        })
    }

    /// Namespace the guard entered.
    #[must_use]
    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[cfg(target_os = "linux")]
impl Drop for NetnsGuard {
    fn drop(&mut self) {
        use rustix::thread::{LinkNameSpaceType, move_into_link_name_space};
        use std::os::fd::AsFd;

        if let Err(e) =
            move_into_link_name_space(self.original.as_fd(), Some(LinkNameSpaceType::Network))
        {
            // Anything this thread does next would act on the wrong namespace.
            tracing::error!(netns = %self.path.display(), error = %e, "Failed to restore network namespace");
            std::process::abort();
        }
        tracing::trace!(netns = %self.path.display(), "Restored network namespace");
    }
}
