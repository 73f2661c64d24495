//! The authorization service: one instance per open storage, shared by every session on it.
//!
//! Lock order is `rebuild_lock`, then `catalog`, then the index slots. Gate calls never take
//! `rebuild_lock` or the catalog write lock.

pub mod admin;
pub mod gates;
pub mod index;
pub mod session;
pub mod tokens;

use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};

use crate::audit::{AuditEvent, AuditHooks, AuditSink, JsonLineAuditSink};
use crate::catalog::SecurityCatalog;
use crate::config::SecurityConfig;
use crate::engine::ResolutionEngine;
use crate::error::SecurityResult;
use crate::predicate::basic::BasicPredicateParser;
use crate::predicate::{EvalContext, PredicateParser};
use crate::privileged::run_without_authorization;
use crate::record::RecordStore;
use crate::resource::{Resource, ResourceResolver};
use crate::schema::SchemaCatalog;
use crate::security::{Argon2Hashing, PasswordHashing};
use crate::snapshot::ImmutablePrincipal;

use self::index::{all_filtered_properties, OptimizationIndex};
use self::tokens::TokenRegistry;

pub use self::session::SecuritySession;

pub struct SecurityService {
    config: SecurityConfig,
    schema: Arc<dyn SchemaCatalog>,
    store: Arc<dyn RecordStore>,
    hasher: Arc<dyn PasswordHashing>,
    catalog: RwLock<SecurityCatalog>,
    resolver: ResourceResolver,
    engine: ResolutionEngine,
    index: RwLock<Option<Arc<OptimizationIndex>>>,
    filtered: RwLock<Option<Arc<HashSet<Resource>>>>,
    version: AtomicU64,
    rebuild_lock: Mutex<()>,
    skip_rebuild: AtomicBool,
    tokens: TokenRegistry,
    audit: AuditHooks,
}

impl SecurityService {
    /// Service over an empty catalog using the built-in predicate language and argon2 hashing.
    pub fn new(config: SecurityConfig, schema: Arc<dyn SchemaCatalog>, store: Arc<dyn RecordStore>) -> Self {
        let engine = ResolutionEngine::new(schema.clone(), Arc::new(BasicPredicateParser), config.predicate_cache_size);
        let tokens = TokenRegistry::new(Duration::from_secs(config.token_ttl_secs));
        let audit = AuditHooks::default();
        if let Some(path) = &config.audit_log_path {
            audit.register(Arc::new(JsonLineAuditSink::new(path)));
        }
        Self {
            config,
            schema,
            store,
            hasher: Arc::new(Argon2Hashing),
            catalog: RwLock::new(SecurityCatalog::new()),
            resolver: ResourceResolver::new(),
            engine,
            index: RwLock::new(None),
            filtered: RwLock::new(None),
            version: AtomicU64::new(0),
            rebuild_lock: Mutex::new(()),
            skip_rebuild: AtomicBool::new(false),
            tokens,
            audit,
        }
    }

    pub fn with_parser(mut self, parser: Arc<dyn PredicateParser>) -> Self {
        self.engine = ResolutionEngine::new(self.schema.clone(), parser, self.config.predicate_cache_size);
        self
    }

    pub fn with_hasher(mut self, hasher: Arc<dyn PasswordHashing>) -> Self {
        self.hasher = hasher;
        self
    }

    /// Replaces the catalog before the service is shared. The catalog is validated first.
    pub fn with_catalog(mut self, catalog: SecurityCatalog) -> SecurityResult<Self> {
        catalog.validate()?;
        self.catalog = RwLock::new(catalog);
        Ok(self)
    }

    /// Storage-open entry point: bootstraps the default roles (and users when configured),
    /// then builds the optimization index.
    pub fn open(config: SecurityConfig, schema: Arc<dyn SchemaCatalog>, store: Arc<dyn RecordStore>) -> SecurityResult<Arc<Self>> {
        let svc = Arc::new(Self::new(config, schema, store));
        svc.bootstrap()?;
        Ok(svc)
    }

    /// Storage-close: drops every service-scoped cache and token.
    pub fn close(&self) {
        self.resolver.clear();
        self.engine.clear_caches();
        *self.index.write() = None;
        *self.filtered.write() = None;
        self.tokens.clear();
        tracing::debug!(target: "rowsec::admin", "security service closed");
    }

    pub fn config(&self) -> &SecurityConfig { &self.config }
    pub fn schema(&self) -> &Arc<dyn SchemaCatalog> { &self.schema }
    pub fn store(&self) -> &Arc<dyn RecordStore> { &self.store }
    pub fn engine(&self) -> &ResolutionEngine { &self.engine }
    pub fn resolver(&self) -> &ResourceResolver { &self.resolver }
    pub fn tokens(&self) -> &TokenRegistry { &self.tokens }

    pub fn register_audit_sink(&self, sink: Arc<dyn AuditSink>) { self.audit.register(sink); }

    pub(crate) fn audit(&self, user: Option<&str>, operation: &str, resource: &str, allowed: bool) {
        if self.audit.is_empty() { return; }
        self.audit.emit(AuditEvent::new(user, operation, resource, allowed));
    }

    /// Read access to the live catalog.
    pub fn read_catalog<T>(&self, f: impl FnOnce(&SecurityCatalog) -> T) -> T { f(&self.catalog.read()) }

    pub fn version(&self) -> u64 { self.version.load(Ordering::Acquire) }

    /// Bumps the security version: cached resolutions are dropped, sessions re-snapshot their
    /// principal on next use and the optimization index is rebuilt.
    pub fn increment_version(&self) -> SecurityResult<u64> {
        let v = self.version.fetch_add(1, Ordering::AcqRel) + 1;
        self.engine.clear_caches();
        self.rebuild_optimizations()?;
        tracing::debug!(target: "rowsec::admin", version = v, "security version incremented");
        Ok(v)
    }

    pub fn optimization_index(&self) -> Option<Arc<OptimizationIndex>> { self.index.read().clone() }

    /// Rebuilds the optimization index and the filtered-property set, then swaps them in.
    /// Suppressed while bootstrap is running.
    pub fn rebuild_optimizations(&self) -> SecurityResult<()> {
        if self.skip_rebuild.load(Ordering::Acquire) { return Ok(()); }
        let _g = self.rebuild_lock.lock();
        let (idx, filtered) = run_without_authorization(|| {
            let cat = self.catalog.read();
            let idx = OptimizationIndex::build(&cat, self.schema.as_ref(), &self.engine, self.version());
            (idx, all_filtered_properties(&cat))
        });
        *self.index.write() = Some(Arc::new(idx));
        *self.filtered.write() = Some(Arc::new(filtered));
        Ok(())
    }

    /// Property resources whose READ rule can hide a column, across all roles.
    pub fn all_filtered_properties(&self) -> SecurityResult<HashSet<Resource>> {
        if let Some(f) = self.filtered.read().as_ref() { return Ok(f.as_ref().clone()); }
        self.rebuild_optimizations()?;
        Ok(self.filtered.read().as_ref().map(|f| f.as_ref().clone()).unwrap_or_default())
    }

    /// Evaluation bindings for one principal; `$currentUser` loads the backing `OUser` record on
    /// first reference.
    pub(crate) fn eval_context<'a>(&'a self, principal: &'a ImmutablePrincipal) -> EvalContext<'a> {
        EvalContext::new()
            .with_store(self.store.as_ref())
            .with_current_user(move || principal.id().and_then(|id| self.catalog.read().user_record(id)))
    }
}
