//! Passthrough I/O forwarding.
//!
//! Once a virtual file is bound to an already-open backing file at
//! open/create time, its read/write data path goes straight to that file
//! instead of round-tripping through the filesystem's request/reply
//! protocol. This module owns the whole lifecycle: the register/bind
//! handshake, the forwarder for blocking and submitted I/O, attribute
//! propagation back into the cached inode, and release on close.

mod attr;
mod backing;
mod cred;
mod error;
mod file;
mod io;
mod registry;

pub use backing::{BackingDescriptor, BackingFile, BackingHandle, BackingSb, Capabilities, FreezeGuard};
pub use cred::Credentials;
pub use error::{PassthroughError, Result};
pub use file::{VirtualFile, VirtualInode};
pub use io::{Completion, IoFlags, IoRequest, ReadDone, WriteDone};
pub use registry::BackingRegistry;

use backing::RegisteredBacking;

use crate::util::open_options::OpenOptions;

/// Hard ceiling on filesystem nesting through passthrough.
pub const FILESYSTEM_MAX_STACK_DEPTH: u32 = 2;

/// Request opcodes of the outer protocol that the setup path must
/// distinguish; passthrough may only attach on open or create.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Lookup,
    Getattr,
    Setattr,
    Open,
    Create,
    Read,
    Write,
    Release,
}

impl Opcode {
    fn accepts_passthrough(self) -> bool {
        matches!(self, Opcode::Open | Opcode::Create)
    }
}

/// Where the backing file for a bind comes from: handed over inline with
/// the open reply, or registered earlier through the two-phase handshake.
pub enum BindSource {
    Descriptor(BackingDescriptor),
    Token(u32),
}

/// Instance-wide knobs for the passthrough layer.
#[derive(Debug, Clone, Copy)]
pub struct PassthroughConfig {
    /// Maximum stacking depth a bind may create.
    pub max_stack_depth: u32,
    /// Whether submitted (asynchronous) forwarding is offered. When off,
    /// `submit_read`/`submit_write` fail with `AsyncUnsupported` and the
    /// caller must use the blocking entry points.
    pub async_forwarding: bool,
    /// Credentials of the mount creator. When set, forwarded operations
    /// run under these instead of the caller's.
    pub mounter_creds: Option<Credentials>,
}

impl Default for PassthroughConfig {
    fn default() -> Self {
        PassthroughConfig {
            max_stack_depth: FILESYSTEM_MAX_STACK_DEPTH,
            async_forwarding: true,
            mounter_creds: None,
        }
    }
}

/// Per-filesystem-instance context: configuration plus the handshake
/// registry. Nothing here is global; separate instances are fully isolated.
#[derive(Debug, Default)]
pub struct PassthroughCtx {
    config: PassthroughConfig,
    registry: BackingRegistry,
}

impl PassthroughCtx {
    pub fn new(config: PassthroughConfig) -> Self {
        PassthroughCtx {
            config,
            registry: BackingRegistry::new(),
        }
    }

    pub fn config(&self) -> &PassthroughConfig {
        &self.config
    }

    pub fn registry(&self) -> &BackingRegistry {
        &self.registry
    }

    pub(crate) fn mounter_creds(&self) -> Option<Credentials> {
        self.config.mounter_creds
    }

    /// First half of the two-phase handshake: validate the candidate's
    /// data-path capabilities and park it in the registry.
    ///
    /// Stacking depth is deliberately not checked here; that happens at
    /// bind time. The registry lock is taken only for the insert itself.
    pub fn register(&self, desc: BackingDescriptor) -> Result<u32> {
        let entry = validate_candidate(desc)?;
        let token = self.registry.insert(entry);
        debug!("registered backing file as token {token}");
        Ok(token)
    }

    /// Bind a backing file into a virtual file's per-open state.
    ///
    /// Validation order, short-circuiting on the first failure: the opcode
    /// must be open or create; the source must resolve to a live file with
    /// both data-path capabilities; the resulting stacking depth must not
    /// exceed the configured maximum. A failed bind leaves no reference
    /// behind: candidate handles are dropped before the error returns.
    pub fn bind(&self, file: &mut VirtualFile, opcode: Opcode, source: BindSource) -> Result<()> {
        if !opcode.accepts_passthrough() {
            return Err(PassthroughError::InvalidOperation);
        }
        if file.is_passthrough() {
            // Binding is legal once per open instance; check before a
            // token could be consumed.
            return Err(PassthroughError::InvalidOperation);
        }

        let entry = match source {
            BindSource::Descriptor(desc) => validate_candidate(desc)?,
            BindSource::Token(token) => self
                .registry
                .remove(token)
                .ok_or(PassthroughError::InvalidHandle)?,
        };

        let stack_depth = entry.sb.stack_depth() + 1;
        if stack_depth > self.config.max_stack_depth {
            error!("maximum fs stacking depth exceeded for passthrough");
            return Err(PassthroughError::StackingDepthExceeded);
        }

        file.attach(BackingFile::new(entry.handle, entry.sb, stack_depth, entry.caps));
        Ok(())
    }

    /// Control-plane entry point for an open/create reply: bind when the
    /// reply carries the passthrough flag, otherwise do nothing.
    ///
    /// Returns whether a binding was established.
    pub fn setup(
        &self,
        file: &mut VirtualFile,
        opcode: Opcode,
        open_flags: OpenOptions,
        source: Option<BindSource>,
    ) -> Result<bool> {
        if !open_flags.contains(OpenOptions::PASSTHROUGH) {
            return Ok(false);
        }
        let source = source.ok_or(PassthroughError::InvalidHandle)?;
        self.bind(file, opcode, source)?;
        Ok(true)
    }
}

/// Shared capability validation for both handshake variants. Consumes the
/// descriptor, so a rejected candidate is released before the error is
/// surfaced.
fn validate_candidate(desc: BackingDescriptor) -> Result<RegisteredBacking> {
    let caps = desc.handle.capabilities().map_err(|e| {
        error!("invalid file descriptor for passthrough: {e}");
        PassthroughError::InvalidHandle
    })?;
    if !caps.contains(Capabilities::READ_ITER | Capabilities::WRITE_ITER) {
        error!("passthrough file misses file operations");
        return Err(PassthroughError::UnsupportedBackingFile);
    }
    Ok(RegisteredBacking {
        handle: desc.handle,
        sb: desc.sb,
        caps,
    })
}
