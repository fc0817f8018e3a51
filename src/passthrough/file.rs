use std::sync::Arc;
use std::sync::RwLock;
use std::sync::atomic::{AtomicU64, Ordering};

use rfuse3::raw::reply::FileAttr;
use tokio::sync::Mutex;

use super::backing::BackingFile;

/// Cached inode of a virtual file: the attributes served to stat-like
/// queries plus the exclusive lock that serializes forwarded writes.
pub struct VirtualInode {
    ino: u64,
    attr: RwLock<FileAttr>,
    // Arc so submitted writes can hold an owned guard across their
    // completion task.
    pub(crate) write_lock: Arc<Mutex<()>>,
}

impl VirtualInode {
    pub fn new(ino: u64, attr: FileAttr) -> Arc<Self> {
        Arc::new(VirtualInode {
            ino,
            attr: RwLock::new(attr),
            write_lock: Arc::new(Mutex::new(())),
        })
    }

    pub fn ino(&self) -> u64 {
        self.ino
    }

    /// Snapshot of the cached attributes.
    pub fn attr(&self) -> FileAttr {
        self.attr.read().unwrap().clone()
    }

    pub fn size(&self) -> u64 {
        self.attr.read().unwrap().size
    }

    /// Apply `f` to the cached attributes in one critical section.
    pub(crate) fn update_attr(&self, f: impl FnOnce(&mut FileAttr)) {
        let mut attr = self.attr.write().unwrap();
        f(&mut attr);
    }
}

impl std::fmt::Debug for VirtualInode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VirtualInode").field("ino", &self.ino).finish_non_exhaustive()
    }
}

/// Per-open state of a virtual file.
///
/// `backing` is `None` for a normal open; once bound by the setup protocol
/// it stays bound for the lifetime of this open instance. The position
/// cursor is shared with submitted-I/O completion tasks, which reconcile it
/// when the backing operation finishes.
pub struct VirtualFile {
    pub(crate) inode: Arc<VirtualInode>,
    pub(crate) backing: Option<Arc<BackingFile>>,
    pub(crate) pos: Arc<AtomicU64>,
}

impl VirtualFile {
    /// A fresh open in normal (non-passthrough) mode.
    pub fn open(inode: Arc<VirtualInode>) -> Self {
        VirtualFile {
            inode,
            backing: None,
            pos: Arc::new(AtomicU64::new(0)),
        }
    }

    pub fn inode(&self) -> &Arc<VirtualInode> {
        &self.inode
    }

    pub fn is_passthrough(&self) -> bool {
        self.backing.is_some()
    }

    pub fn backing(&self) -> Option<&Arc<BackingFile>> {
        self.backing.as_ref()
    }

    /// Position cursor after the most recent forwarded operation.
    pub fn pos(&self) -> u64 {
        self.pos.load(Ordering::Acquire)
    }

    /// Transfer ownership of a bound backing reference into this open.
    /// The caller has already verified that no reference is attached.
    pub(crate) fn attach(&mut self, backing: Arc<BackingFile>) {
        debug_assert!(self.backing.is_none());
        trace!(
            "ino {}: passthrough bound at stack depth {}",
            self.inode.ino(),
            backing.stack_depth()
        );
        self.backing = Some(backing);
    }

    /// Drop the backing reference. Safe to call on an unbound open and safe
    /// to call twice; the second call is a no-op.
    pub fn release(&mut self) {
        if let Some(backing) = self.backing.take() {
            trace!("ino {}: passthrough released", self.inode.ino());
            drop(backing);
        }
    }
}

impl Drop for VirtualFile {
    fn drop(&mut self) {
        self.release();
    }
}
