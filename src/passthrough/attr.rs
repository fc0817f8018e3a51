use rfuse3::raw::reply::FileAttr;

use super::file::VirtualInode;

/// Copy size and timestamps from the backing file's metadata into the
/// virtual inode's cached attributes.
///
/// Runs after every successful forwarded write of more than zero bytes,
/// while the caller still holds the per-inode writer lock. All fields are
/// updated inside a single critical section on the attribute lock so a
/// concurrent stat never observes a size from one write and timestamps
/// from another.
///
/// The read path deliberately never comes here: reads only notify the
/// backing handle's own access-time bookkeeping and leave the cached
/// attributes alone.
pub(crate) fn propagate_write_attrs(inode: &VirtualInode, src: &FileAttr) {
    inode.update_attr(|attr| {
        attr.size = src.size;
        attr.blocks = src.blocks;
        attr.atime = src.atime;
        attr.mtime = src.mtime;
        attr.ctime = src.ctime;
    });
}
