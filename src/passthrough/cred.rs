use std::io;

/// uid/gid pair forwarded operations run as.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Credentials {
    pub uid: libc::uid_t,
    pub gid: libc::gid_t,
}

impl Credentials {
    /// Effective credentials of the calling thread.
    pub fn current() -> Self {
        // Safe: geteuid/getegid take no arguments and cannot fail.
        unsafe {
            Credentials {
                uid: libc::geteuid(),
                gid: libc::getegid(),
            }
        }
    }
}

/// Temporarily runs the current thread with the mount creator's
/// credentials; the previous credentials are restored on drop, on every
/// exit path.
///
/// The raw setres{u,g}id syscalls are used instead of the libc wrappers
/// because glibc broadcasts the wrappers to every thread of the process,
/// while forwarded I/O must only affect the thread issuing the backing
/// operation.
pub(crate) struct ScopedCreds {
    saved: Credentials,
}

impl ScopedCreds {
    /// Switch to `creds` if they differ from the thread's effective ids.
    /// Returns `None` (no-op guard) when no switch is needed.
    pub(crate) fn switch(creds: Credentials) -> io::Result<Option<Self>> {
        let saved = Credentials::current();
        if saved == creds {
            return Ok(None);
        }

        // gid first: once the uid changes we may no longer have the
        // privilege to change the gid.
        set_thread_gid(creds.gid)?;
        if let Err(e) = set_thread_uid(creds.uid) {
            if let Err(e2) = set_thread_gid(saved.gid) {
                error!("failed to restore gid {} after failed uid switch: {e2}", saved.gid);
            }
            return Err(e);
        }
        Ok(Some(ScopedCreds { saved }))
    }
}

impl Drop for ScopedCreds {
    fn drop(&mut self) {
        if let Err(e) = set_thread_uid(self.saved.uid) {
            error!("failed to restore uid {}: {e}", self.saved.uid);
        }
        if let Err(e) = set_thread_gid(self.saved.gid) {
            error!("failed to restore gid {}: {e}", self.saved.gid);
        }
    }
}

fn set_thread_uid(uid: libc::uid_t) -> io::Result<()> {
    // Safe: the syscall does not touch memory and the result is checked.
    let res = unsafe { libc::syscall(libc::SYS_setresuid, -1, uid, -1) };
    if res == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

fn set_thread_gid(gid: libc::gid_t) -> io::Result<()> {
    // Safe: the syscall does not touch memory and the result is checked.
    let res = unsafe { libc::syscall(libc::SYS_setresgid, -1, gid, -1) };
    if res == 0 {
        Ok(())
    } else {
        Err(io::Error::last_os_error())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn matching_creds_are_a_noop() {
        let guard = ScopedCreds::switch(Credentials::current()).unwrap();
        assert!(guard.is_none());
    }

    #[test]
    fn switch_restores_previous_creds_on_drop() {
        let me = Credentials::current();
        let other = Credentials {
            uid: me.uid,
            gid: if me.gid == 65534 { 65533 } else { 65534 },
        };
        // Requires privilege; skipped when running unprivileged.
        let guard = crate::unwrap_or_skip_eperm!(ScopedCreds::switch(other), "setresgid");
        assert!(guard.is_some());
        drop(guard);
        assert_eq!(Credentials::current(), me);
    }
}
