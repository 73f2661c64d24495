//! Authorization and row/column security kernel for an embedded multi-model database.
//!
//! Roles carry legacy permission bitmasks and predicate policies bound to resources. Sessions
//! hold immutable snapshots of their principal; the [`service::SecurityService`] resolves the
//! predicate that applies to a record for one scope and evaluates it.

pub mod error;
pub mod config;
pub mod rule;
pub mod resource;
pub mod policy;
pub mod record;
pub mod schema;
pub mod role;
pub mod user;
pub mod security;
pub mod catalog;
pub mod snapshot;
pub mod predicate;
pub mod privileged;
pub mod engine;
pub mod restricted;
pub mod audit;
pub mod service;

pub use crate::catalog::SecurityCatalog;
pub use crate::config::SecurityConfig;
pub use crate::error::{SecurityError, SecurityResult};
pub use crate::policy::{Scope, SecurityPolicy};
pub use crate::resource::{Resource, ResourceResolver, Target};
pub use crate::rule::{Permission, PermissionRule, ResourceGeneric};
pub use crate::service::{SecurityService, SecuritySession};
pub use crate::snapshot::{ImmutablePrincipal, ImmutableRole};

// Test-only printing helper: expands to eprintln! in tests and debug builds and is a no-op otherwise.
// Usage: tprintln!("debug: {}", value);
#[cfg(any(test, debug_assertions))]
#[macro_export]
macro_rules! tprintln {
    ($($arg:tt)*) => ( eprintln!($($arg)*) );
}

// In release builds, provide a no-op tprintln! so calls compile without effect.
#[cfg(not(any(test, debug_assertions)))]
#[macro_export]
macro_rules! tprintln {
    ($($arg:tt)*) => ({
        // Preserve formatting checks in release without producing code
        if false { let _ = format!($($arg)*); }
    });
}
