use std::sync::Arc;
use std::sync::atomic::Ordering;

use bitflags::bitflags;
use bytes::{Bytes, BytesMut};
use tokio::sync::oneshot;

use super::PassthroughCtx;
use super::attr;
use super::backing::BackingFile;
use super::cred::{Credentials, ScopedCreds};
use super::error::{PassthroughError, Result};
use super::file::{VirtualFile, VirtualInode};

bitflags! {
    /// Per-request flags carried by a forwarded operation, mirroring the
    /// flag set of the outer protocol's read/write requests.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IoFlags: u32 {
        /// Write at end-of-file regardless of the requested offset.
        const APPEND = 1;
        /// Flush data and metadata to stable storage after the transfer.
        const SYNC = 2;
        /// Flush data only.
        const DSYNC = 4;
        /// High-priority request; forwarded unchanged, no special handling.
        const HIPRI = 8;
        /// Fail with EAGAIN instead of waiting for the inode lock or a
        /// frozen backing filesystem.
        const NOWAIT = 16;
    }
}

/// An in-flight forwarded request.
#[derive(Debug, Clone, Copy, Default)]
pub struct IoRequest {
    pub offset: u64,
    pub flags: IoFlags,
}

impl IoRequest {
    pub fn at(offset: u64) -> Self {
        IoRequest {
            offset,
            flags: IoFlags::empty(),
        }
    }

    pub fn with_flags(offset: u64, flags: IoFlags) -> Self {
        IoRequest { offset, flags }
    }
}

/// Final state of a submitted read.
#[derive(Debug)]
pub struct ReadDone {
    pub result: Result<usize>,
    /// The buffer handed to `submit_read`, with the read bytes in place.
    pub buf: BytesMut,
}

/// Final state of a submitted write.
#[derive(Debug)]
pub struct WriteDone {
    pub result: Result<usize>,
}

#[derive(Debug)]
enum CompletionState<T> {
    /// Short-circuited before any backing operation was issued.
    Ready(Option<T>),
    Waiting(oneshot::Receiver<T>),
}

/// Caller's side of a submitted operation. Resolved exactly once, after the
/// completion task has reconciled cursor and attributes.
#[derive(Debug)]
pub struct Completion<T> {
    state: CompletionState<T>,
}

impl<T> Completion<T> {
    fn ready(value: T) -> Self {
        Completion {
            state: CompletionState::Ready(Some(value)),
        }
    }

    fn waiting(rx: oneshot::Receiver<T>) -> Self {
        Completion {
            state: CompletionState::Waiting(rx),
        }
    }

    /// Wait for the backing operation to finish. Dropping the completion
    /// instead does not cancel the backing operation; it just discards the
    /// notification.
    pub async fn wait(self) -> Result<T> {
        match self.state {
            CompletionState::Ready(value) => Ok(value.expect("completion consumed twice")),
            CompletionState::Waiting(rx) => rx.await.map_err(|_| {
                PassthroughError::Io(std::io::Error::from_raw_os_error(libc::ECANCELED))
            }),
        }
    }
}

impl VirtualFile {
    /// Forward a blocking read to the backing file.
    ///
    /// On success the cursor moves to the backing file's post-read position
    /// and the backing handle gets an access-time notification. The cached
    /// attributes of the virtual inode are never touched on the read path.
    pub fn read(&self, ctx: &PassthroughCtx, buf: &mut [u8], req: IoRequest) -> Result<usize> {
        let backing = self.backing.as_ref().ok_or(PassthroughError::InvalidOperation)?;
        if buf.is_empty() {
            return Ok(0);
        }

        let n = {
            let _creds = switch_creds(ctx.mounter_creds())?;
            backing.handle().read_at(buf, req.offset)?
        };
        self.pos.store(req.offset + n as u64, Ordering::Release);
        backing.handle().accessed();
        Ok(n)
    }

    /// Forward a blocking write to the backing file.
    ///
    /// The virtual inode's writer lock is held across the transfer and the
    /// attribute propagation that follows; the backing super block is
    /// marked as inside-a-write for exactly the duration of the transfer.
    pub async fn write(&self, ctx: &PassthroughCtx, data: &[u8], req: IoRequest) -> Result<usize> {
        let backing = self.backing.as_ref().ok_or(PassthroughError::InvalidOperation)?;
        if data.is_empty() {
            return Ok(0);
        }

        let nowait = req.flags.contains(IoFlags::NOWAIT);
        let _ilock = if nowait {
            match self.inode.write_lock.try_lock() {
                Ok(guard) => guard,
                Err(_) => return Err(would_block()),
            }
        } else {
            self.inode.write_lock.lock().await
        };

        let wguard = if nowait {
            backing.sb().try_start_write().ok_or_else(would_block)?
        } else {
            backing.sb().start_write().await
        };

        let offset = effective_offset(backing, req)?;
        let n = {
            let _creds = switch_creds(ctx.mounter_creds())?;
            let n = backing.handle().write_at(data, offset)?;
            sync_if_requested(backing, req.flags)?;
            n
        };
        drop(wguard);

        if n > 0 {
            let st = backing.handle().stat()?;
            attr::propagate_write_attrs(&self.inode, &st);
        }
        self.pos.store(offset + n as u64, Ordering::Release);
        Ok(n)
    }

    /// Submit a read for asynchronous completion.
    ///
    /// Returns immediately with a [`Completion`]; a private completion task
    /// performs the transfer, reconciles the cursor and then resolves the
    /// completion exactly once with the backing result.
    pub fn submit_read(
        &self,
        ctx: &PassthroughCtx,
        mut buf: BytesMut,
        req: IoRequest,
    ) -> Result<Completion<ReadDone>> {
        let backing = self
            .backing
            .as_ref()
            .ok_or(PassthroughError::InvalidOperation)?
            .clone();
        if buf.is_empty() {
            return Ok(Completion::ready(ReadDone { result: Ok(0), buf }));
        }
        let handle = submission_runtime(ctx)?;

        let creds = ctx.mounter_creds();
        let pos = self.pos.clone();
        let (tx, rx) = oneshot::channel();

        handle.spawn(async move {
            let result = forward_read(&backing, creds, &mut buf, req, &pos);
            if tx.send(ReadDone { result, buf }).is_err() {
                trace!("read completion discarded by caller");
            }
        });
        Ok(Completion::waiting(rx))
    }

    /// Submit a write for asynchronous completion.
    ///
    /// Inode locking, freeze accounting and attribute propagation are
    /// handed off to the completion task; the caller's completion resolves
    /// only after the virtual inode's cached size reflects the write.
    pub fn submit_write(
        &self,
        ctx: &PassthroughCtx,
        data: Bytes,
        req: IoRequest,
    ) -> Result<Completion<WriteDone>> {
        let backing = self
            .backing
            .as_ref()
            .ok_or(PassthroughError::InvalidOperation)?
            .clone();
        if data.is_empty() {
            return Ok(Completion::ready(WriteDone { result: Ok(0) }));
        }
        let handle = submission_runtime(ctx)?;

        let creds = ctx.mounter_creds();
        let inode = self.inode.clone();
        let pos = self.pos.clone();
        let (tx, rx) = oneshot::channel();

        handle.spawn(async move {
            let result = forward_write(&backing, &inode, creds, &data, req, &pos).await;
            if tx.send(WriteDone { result }).is_err() {
                trace!("write completion discarded by caller");
            }
        });
        Ok(Completion::waiting(rx))
    }
}

/// Body of a submitted read, shared with nothing else: the synchronous path
/// inlines the same steps so it can borrow the caller's buffer.
fn forward_read(
    backing: &Arc<BackingFile>,
    creds: Option<Credentials>,
    buf: &mut BytesMut,
    req: IoRequest,
    pos: &std::sync::atomic::AtomicU64,
) -> Result<usize> {
    let n = {
        let _creds = switch_creds(creds)?;
        backing.handle().read_at(buf.as_mut(), req.offset)?
    };
    pos.store(req.offset + n as u64, Ordering::Release);
    backing.handle().accessed();
    Ok(n)
}

async fn forward_write(
    backing: &Arc<BackingFile>,
    inode: &Arc<VirtualInode>,
    creds: Option<Credentials>,
    data: &[u8],
    req: IoRequest,
    pos: &std::sync::atomic::AtomicU64,
) -> Result<usize> {
    let nowait = req.flags.contains(IoFlags::NOWAIT);
    let _ilock = if nowait {
        match inode.write_lock.clone().try_lock_owned() {
            Ok(guard) => guard,
            Err(_) => return Err(would_block()),
        }
    } else {
        inode.write_lock.clone().lock_owned().await
    };

    let wguard = if nowait {
        backing.sb().try_start_write().ok_or_else(would_block)?
    } else {
        backing.sb().start_write().await
    };

    let offset = effective_offset(backing, req)?;
    let n = {
        let _creds = switch_creds(creds)?;
        let n = backing.handle().write_at(data, offset)?;
        sync_if_requested(backing, req.flags)?;
        n
    };
    drop(wguard);

    if n > 0 {
        let st = backing.handle().stat()?;
        attr::propagate_write_attrs(inode, &st);
    }
    pos.store(offset + n as u64, Ordering::Release);
    Ok(n)
}

fn effective_offset(backing: &Arc<BackingFile>, req: IoRequest) -> Result<u64> {
    if req.flags.contains(IoFlags::APPEND) {
        // Safe against concurrent size changes of this virtual file: the
        // caller holds the inode writer lock.
        Ok(backing.handle().stat()?.size)
    } else {
        Ok(req.offset)
    }
}

fn sync_if_requested(backing: &Arc<BackingFile>, flags: IoFlags) -> Result<()> {
    if flags.contains(IoFlags::SYNC) {
        backing.handle().sync(false)?;
    } else if flags.contains(IoFlags::DSYNC) {
        backing.handle().sync(true)?;
    }
    Ok(())
}

fn switch_creds(creds: Option<Credentials>) -> Result<Option<ScopedCreds>> {
    match creds {
        Some(creds) => Ok(ScopedCreds::switch(creds)?),
        None => Ok(None),
    }
}

fn submission_runtime(ctx: &PassthroughCtx) -> Result<tokio::runtime::Handle> {
    if !ctx.config().async_forwarding {
        return Err(PassthroughError::AsyncUnsupported);
    }
    // No runtime means no place to run the completion context; report it as
    // the retryable allocation failure so the caller can fall back to the
    // synchronous path.
    tokio::runtime::Handle::try_current().map_err(|_| PassthroughError::AllocationFailure)
}

fn would_block() -> PassthroughError {
    PassthroughError::Io(std::io::Error::from_raw_os_error(libc::EAGAIN))
}
