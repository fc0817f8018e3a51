use std::fs::File;
use std::io;
use std::os::fd::AsRawFd;
use std::sync::Arc;

use bitflags::bitflags;
use rfuse3::raw::reply::FileAttr;
use tokio::sync::{OwnedRwLockReadGuard, OwnedRwLockWriteGuard, RwLock};

use crate::util::convert_stat64_to_file_attr;

bitflags! {
    /// Data-path operations a backing file must provide before it can be
    /// accepted for passthrough.
    #[derive(Debug, Clone, Copy, PartialEq, Eq)]
    pub struct Capabilities: u32 {
        /// The file supports the streaming read data path.
        const READ_ITER = 1;
        /// The file supports the streaming write data path.
        const WRITE_ITER = 2;
    }
}

/// An open file on the underlying filesystem that forwarded I/O is issued
/// against.
///
/// Implemented for [`std::fs::File`]; tests install their own
/// implementations to observe call ordering.
pub trait BackingHandle: Send + Sync + 'static {
    /// Read up to `buf.len()` bytes at `offset`.
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize>;

    /// Write `data` at `offset`.
    fn write_at(&self, data: &[u8], offset: u64) -> io::Result<usize>;

    /// Current metadata of the backing file.
    fn stat(&self) -> io::Result<FileAttr>;

    /// Data-path capabilities of the file.
    fn capabilities(&self) -> io::Result<Capabilities>;

    /// Flush written data (and metadata unless `data_only`) to stable storage.
    fn sync(&self, data_only: bool) -> io::Result<()>;

    /// Access-time notification after a forwarded read. The default is a
    /// no-op: for real files the underlying filesystem maintains atime on
    /// its own when the read goes through the fd.
    fn accessed(&self) {}
}

impl BackingHandle for File {
    fn read_at(&self, buf: &mut [u8], offset: u64) -> io::Result<usize> {
        nix::sys::uio::pread(self, buf, offset as libc::off_t).map_err(io::Error::from)
    }

    fn write_at(&self, data: &[u8], offset: u64) -> io::Result<usize> {
        nix::sys::uio::pwrite(self, data, offset as libc::off_t).map_err(io::Error::from)
    }

    fn stat(&self) -> io::Result<FileAttr> {
        let mut st = std::mem::MaybeUninit::<libc::stat64>::zeroed();
        // Safe: fstat64 only writes into the provided buffer and we check
        // the return value before assuming it is initialized.
        let ret = unsafe { libc::fstat64(self.as_raw_fd(), st.as_mut_ptr()) };
        if ret < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(convert_stat64_to_file_attr(unsafe { st.assume_init() }))
    }

    fn capabilities(&self) -> io::Result<Capabilities> {
        // Safe: F_GETFL takes no argument and does not touch memory.
        let flags = unsafe { libc::fcntl(self.as_raw_fd(), libc::F_GETFL) };
        if flags < 0 {
            return Err(io::Error::last_os_error());
        }
        let caps = match flags & libc::O_ACCMODE {
            libc::O_RDWR => Capabilities::READ_ITER | Capabilities::WRITE_ITER,
            libc::O_RDONLY => Capabilities::READ_ITER,
            libc::O_WRONLY => Capabilities::WRITE_ITER,
            _ => Capabilities::empty(),
        };
        Ok(caps)
    }

    fn sync(&self, data_only: bool) -> io::Result<()> {
        if data_only {
            self.sync_data()
        } else {
            self.sync_all()
        }
    }
}

/// Super-block model of the backing filesystem: its recorded stacking depth
/// plus the freeze/write-accounting state forwarded writes participate in.
#[derive(Debug)]
pub struct BackingSb {
    stack_depth: u32,
    freeze: Arc<RwLock<()>>,
}

/// Guard held while the backing filesystem is frozen. Dropping it thaws the
/// filesystem and wakes writers blocked in [`BackingSb::start_write`].
pub struct FreezeGuard {
    _guard: OwnedRwLockWriteGuard<()>,
}

/// Guard held by a forwarded write for its whole duration; counts the write
/// against freeze accounting.
pub(crate) struct WriteGuard {
    _guard: OwnedRwLockReadGuard<()>,
}

impl BackingSb {
    pub fn new(stack_depth: u32) -> Arc<Self> {
        Arc::new(BackingSb {
            stack_depth,
            freeze: Arc::new(RwLock::new(())),
        })
    }

    /// Stacking depth recorded for this filesystem (0 for a plain host fs).
    pub fn stack_depth(&self) -> u32 {
        self.stack_depth
    }

    /// Block until the filesystem is not frozen, then account one in-flight
    /// write. The guard must live for the whole backing write.
    pub(crate) async fn start_write(&self) -> WriteGuard {
        WriteGuard {
            _guard: self.freeze.clone().read_owned().await,
        }
    }

    /// Non-blocking variant of [`BackingSb::start_write`], used for NOWAIT
    /// requests. Returns `None` while the filesystem is frozen.
    pub(crate) fn try_start_write(&self) -> Option<WriteGuard> {
        self.freeze
            .clone()
            .try_read_owned()
            .ok()
            .map(|g| WriteGuard { _guard: g })
    }

    /// Freeze the filesystem: waits for every in-flight forwarded write and
    /// blocks new ones until the returned guard is dropped.
    pub async fn freeze(&self) -> FreezeGuard {
        FreezeGuard {
            _guard: self.freeze.clone().write_owned().await,
        }
    }
}

/// A bound backing file: the reference-counted handle, its super block and
/// the stacking depth computed at bind time.
pub struct BackingFile {
    handle: Arc<dyn BackingHandle>,
    sb: Arc<BackingSb>,
    stack_depth: u32,
    caps: Capabilities,
}

impl BackingFile {
    pub(crate) fn new(
        handle: Arc<dyn BackingHandle>,
        sb: Arc<BackingSb>,
        stack_depth: u32,
        caps: Capabilities,
    ) -> Arc<Self> {
        Arc::new(BackingFile {
            handle,
            sb,
            stack_depth,
            caps,
        })
    }

    pub(crate) fn handle(&self) -> &Arc<dyn BackingHandle> {
        &self.handle
    }

    pub(crate) fn sb(&self) -> &Arc<BackingSb> {
        &self.sb
    }

    /// Depth this binding placed the virtual filesystem at.
    pub fn stack_depth(&self) -> u32 {
        self.stack_depth
    }

    pub fn capabilities(&self) -> Capabilities {
        self.caps
    }
}

impl std::fmt::Debug for BackingFile {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BackingFile")
            .field("stack_depth", &self.stack_depth)
            .field("caps", &self.caps)
            .finish_non_exhaustive()
    }
}

/// A capability-validated backing file sitting in the registry, waiting for
/// the bind that will compute its stacking depth and attach it.
pub(crate) struct RegisteredBacking {
    pub(crate) handle: Arc<dyn BackingHandle>,
    pub(crate) sb: Arc<BackingSb>,
    pub(crate) caps: Capabilities,
}

impl std::fmt::Debug for RegisteredBacking {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RegisteredBacking")
            .field("caps", &self.caps)
            .field("fs_depth", &self.sb.stack_depth())
            .finish_non_exhaustive()
    }
}

/// A candidate backing file handed to bind/register by the control plane:
/// the open handle plus the super block of the filesystem it lives on.
#[derive(Clone)]
pub struct BackingDescriptor {
    pub handle: Arc<dyn BackingHandle>,
    pub sb: Arc<BackingSb>,
}

impl BackingDescriptor {
    pub fn new(handle: Arc<dyn BackingHandle>, sb: Arc<BackingSb>) -> Self {
        BackingDescriptor { handle, sb }
    }

    /// Wrap a plain host file (stacking depth 0).
    pub fn from_file(file: File) -> Self {
        BackingDescriptor {
            handle: Arc::new(file),
            sb: BackingSb::new(0),
        }
    }
}
