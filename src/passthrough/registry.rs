use std::collections::HashMap;
use std::sync::Mutex;

use super::backing::RegisteredBacking;

/// Ephemeral table mapping handshake tokens to registered-but-unbound
/// backing files.
///
/// One table exists per filesystem instance and is only touched during the
/// register/bind window. The mutex covers the insert/remove pair and
/// nothing else: capability validation and all I/O happen outside of it.
/// Tokens grow monotonically, so a consumed token can never be resurrected
/// by a later registration.
#[derive(Debug, Default)]
pub struct BackingRegistry {
    inner: Mutex<Table>,
}

#[derive(Debug, Default)]
struct Table {
    entries: HashMap<u32, RegisteredBacking>,
    next_token: u32,
}

impl BackingRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a validated backing file and hand out its token.
    pub(crate) fn insert(&self, backing: RegisteredBacking) -> u32 {
        let mut table = self.inner.lock().unwrap();
        table.next_token += 1;
        let token = table.next_token;
        table.entries.insert(token, backing);
        token
    }

    /// Remove and return the entry for `token`. A token is consumed by its
    /// first successful lookup.
    pub(crate) fn remove(&self, token: u32) -> Option<RegisteredBacking> {
        self.inner.lock().unwrap().entries.remove(&token)
    }

    /// Number of live (registered, not yet bound) entries.
    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Drop for BackingRegistry {
    fn drop(&mut self) {
        // A register without a matching bind is a protocol violation by the
        // control plane; surface it instead of dropping the files silently.
        let table = self.inner.get_mut().unwrap();
        for (token, backing) in table.entries.drain() {
            error!("backing file for token {token} leaked at teardown: {backing:?}");
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use super::*;
    use crate::passthrough::backing::{BackingSb, Capabilities, RegisteredBacking};

    fn entry() -> RegisteredBacking {
        let dir = "/tmp/libpassthrough-fs/registry";
        std::fs::create_dir_all(dir).unwrap();
        let file = std::fs::OpenOptions::new()
            .read(true)
            .write(true)
            .create(true)
            .truncate(true)
            .open(format!("{dir}/entry"))
            .unwrap();
        RegisteredBacking {
            handle: Arc::new(file),
            sb: BackingSb::new(0),
            caps: Capabilities::READ_ITER | Capabilities::WRITE_ITER,
        }
    }

    #[test]
    fn tokens_are_consumed_and_never_reused() {
        let registry = BackingRegistry::new();
        let first = registry.insert(entry());
        assert!(registry.remove(first).is_some());
        assert!(registry.remove(first).is_none());

        let second = registry.insert(entry());
        assert_ne!(first, second);
        assert!(registry.remove(second).is_some());
    }

    #[test]
    fn tokens_are_positive_and_unique_while_live() {
        let registry = BackingRegistry::new();
        let a = registry.insert(entry());
        let b = registry.insert(entry());
        assert!(a > 0 && b > 0);
        assert_ne!(a, b);
        assert_eq!(registry.len(), 2);
        registry.remove(a);
        registry.remove(b);
        assert!(registry.is_empty());
    }
}
