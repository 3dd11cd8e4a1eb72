//! Per-path exclusion for staging calls

use std::collections::HashSet;
use std::sync::{Condvar, Mutex};

/// Table of paths currently held by a staging call
#[derive(Debug, Default)]
pub struct PathLocks {
    held: Mutex<HashSet<String>>,
    released: Condvar,
}

/// Releases its paths on drop
#[derive(Debug)]
pub struct PathGuard<'a> {
    locks: &'a PathLocks,
    paths: Vec<String>,
}

impl PathLocks {
    pub fn new() -> Self {
        Self::default()
    }

    /// Block until every path in `paths` is free, then take them all at once.
    /// Taking the whole set in one step keeps overlapping calls from deadlocking.
    pub fn acquire<S: AsRef<str>>(&self, paths: &[S]) -> PathGuard<'_> {
        let mut wanted: Vec<String> = paths.iter().map(|p| p.as_ref().to_string()).collect();
        wanted.sort();
        wanted.dedup();

        let mut held = self.held.lock().unwrap_or_else(|e| e.into_inner());
        while wanted.iter().any(|path| held.contains(path)) {
            held = self
                .released
                .wait(held)
                .unwrap_or_else(|e| e.into_inner());
        }
        held.extend(wanted.iter().cloned());

        PathGuard {
            locks: self,
            paths: wanted,
        }
    }

    /// True while any staging call holds a path
    pub fn in_flight(&self) -> bool {
        !self
            .held
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_empty()
    }
}

impl Drop for PathGuard<'_> {
    fn drop(&mut self) {
        let mut held = self.locks.held.lock().unwrap_or_else(|e| e.into_inner());
        for path in &self.paths {
            held.remove(path);
        }
        self.locks.released.notify_all();
    }
}
