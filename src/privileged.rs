//! Thread-local "no nested authorization" mode.
//! Predicate evaluation and index rebuilds run inside it so that record loads they trigger
//! do not re-enter the gates.

use std::cell::Cell;

thread_local! {
    static TLS_NO_AUTH: Cell<bool> = const { Cell::new(false) };
}

pub fn is_privileged() -> bool { TLS_NO_AUTH.with(|c| c.get()) }

/// Restores the previous mode on drop, including during unwinding.
pub struct NoAuthGuard {
    previous: bool,
}

impl NoAuthGuard {
    pub fn enter() -> Self {
        let previous = TLS_NO_AUTH.with(|c| c.replace(true));
        NoAuthGuard { previous }
    }
}

impl Drop for NoAuthGuard {
    fn drop(&mut self) { TLS_NO_AUTH.with(|c| c.set(self.previous)); }
}

pub fn run_without_authorization<T>(f: impl FnOnce() -> T) -> T {
    let _guard = NoAuthGuard::enter();
    f()
}
