#![allow(clippy::unnecessary_cast)]
pub mod open_options;

use rfuse3::{FileType, Timestamp, raw::reply::FileAttr};

/// Build an rfuse3 [`FileAttr`] from a raw stat64 of the backing file.
pub fn convert_stat64_to_file_attr(stat: libc::stat64) -> FileAttr {
    FileAttr {
        ino: stat.st_ino,
        size: stat.st_size as u64,
        blocks: stat.st_blocks as u64,
        atime: Timestamp::new(stat.st_atime, stat.st_atime_nsec.try_into().unwrap_or(0)),
        mtime: Timestamp::new(stat.st_mtime, stat.st_mtime_nsec.try_into().unwrap_or(0)),
        ctime: Timestamp::new(stat.st_ctime, stat.st_ctime_nsec.try_into().unwrap_or(0)),
        kind: filetype_from_mode(stat.st_mode as u32),
        perm: (stat.st_mode & 0o7777) as u16,
        nlink: stat.st_nlink as u32,
        uid: stat.st_uid,
        gid: stat.st_gid,
        rdev: stat.st_rdev as u32,
        blksize: stat.st_blksize as u32,
    }
}

pub fn filetype_from_mode(st_mode: u32) -> FileType {
    match st_mode & (libc::S_IFMT as u32) {
        m if m == libc::S_IFIFO as u32 => FileType::NamedPipe,
        m if m == libc::S_IFCHR as u32 => FileType::CharDevice,
        m if m == libc::S_IFBLK as u32 => FileType::BlockDevice,
        m if m == libc::S_IFDIR as u32 => FileType::Directory,
        m if m == libc::S_IFLNK as u32 => FileType::Symlink,
        m if m == libc::S_IFSOCK as u32 => FileType::Socket,
        m if m == libc::S_IFREG as u32 => FileType::RegularFile,
        other => {
            error!("unexpected st_mode {other:#o}, treating as regular file");
            FileType::RegularFile
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn regular_file_mode_maps_to_regular_file() {
        assert_eq!(
            filetype_from_mode(libc::S_IFREG as u32 | 0o644),
            FileType::RegularFile
        );
        assert_eq!(
            filetype_from_mode(libc::S_IFDIR as u32 | 0o755),
            FileType::Directory
        );
    }
}
