use bitflags::bitflags;

// Flags used by the OPEN request/reply.
/// Bypass page cache for this open file.
const FOPEN_DIRECT_IO: u32 = 1;

/// Don't invalidate the data cache on open.
const FOPEN_KEEP_CACHE: u32 = 2;

/// The file is not seekable.
const FOPEN_NONSEEKABLE: u32 = 4;

/// allow caching this directory
const FOPEN_CACHE_DIR: u32 = 8;

/// the file is stream-like (no file position at all)
const FOPEN_STREAM: u32 = 16;

/// Don't send an implicit FLUSH request when the last file handle closes.
const FOPEN_NOFLUSH: u32 = 32;

/// The filesystem handles parallel direct writes to the same file itself.
const FOPEN_PARALLEL_DIRECT_WRITES: u32 = 64;

/// Enables passthrough I/O: after this open, read/write on the file go
/// directly to the bound backing file, bypassing the request/reply
/// protocol.
const FOPEN_PASSTHROUGH: u32 = 128;

bitflags! {
    /// Options carried on an open or create reply, controlling how the
    /// opened file behaves.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct OpenOptions: u32 {
        /// Bypass page cache for this open file.
        const DIRECT_IO = FOPEN_DIRECT_IO;
        /// Don't invalidate the data cache on open.
        const KEEP_CACHE = FOPEN_KEEP_CACHE;
        /// The file is not seekable.
        const NONSEEKABLE = FOPEN_NONSEEKABLE;
        /// allow caching this directory
        const CACHE_DIR = FOPEN_CACHE_DIR;
        /// the file is stream-like (no file position at all)
        const STREAM = FOPEN_STREAM;
        /// No implicit FLUSH when the last file handle closes.
        const NOFLUSH = FOPEN_NOFLUSH;
        /// Parallel direct writes are handled by the filesystem itself.
        const PARALLEL_DIRECT_WRITES = FOPEN_PARALLEL_DIRECT_WRITES;
        /// Forward subsequent I/O to the bound backing file.
        const PASSTHROUGH = FOPEN_PASSTHROUGH;
    }
}
