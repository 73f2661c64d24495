//! Typed security resources and the memoizing resolver that turns resource paths into them.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use anyhow::anyhow;
use parking_lot::RwLock;

use crate::error::{SecurityError, SecurityResult};
use crate::rule::ResourceGeneric;

/// A concrete name or the `*` wildcard.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Target {
    Any,
    Named(String),
}

impl Target {
    fn parse(seg: &str) -> Target {
        if seg == "*" { Target::Any } else { Target::Named(seg.to_string()) }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Target::Any => None,
            Target::Named(n) => Some(n.as_str()),
        }
    }

    pub fn is_any(&self) -> bool { matches!(self, Target::Any) }
}

impl fmt::Display for Target {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Target::Any => f.write_str("*"),
            Target::Named(n) if n.contains('.') || n.contains('`') || n.contains(' ') => write!(f, "`{}`", n.replace('`', "\\`")),
            Target::Named(n) => f.write_str(n),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DatabaseOp {
    Database,
    Create,
    Copy,
    Drop,
    Exists,
    Command,
    CommandGremlin,
    Freeze,
    Release,
    Passthrough,
    BypassRestricted,
    RecordHook,
    SystemClusters,
}

impl DatabaseOp {
    const ALL: [DatabaseOp; 13] = [
        DatabaseOp::Database,
        DatabaseOp::Create,
        DatabaseOp::Copy,
        DatabaseOp::Drop,
        DatabaseOp::Exists,
        DatabaseOp::Command,
        DatabaseOp::CommandGremlin,
        DatabaseOp::Freeze,
        DatabaseOp::Release,
        DatabaseOp::Passthrough,
        DatabaseOp::BypassRestricted,
        DatabaseOp::RecordHook,
        DatabaseOp::SystemClusters,
    ];

    pub fn path(self) -> &'static str {
        match self {
            DatabaseOp::Database => "database",
            DatabaseOp::Create => "database.create",
            DatabaseOp::Copy => "database.copy",
            DatabaseOp::Drop => "database.drop",
            DatabaseOp::Exists => "database.exists",
            DatabaseOp::Command => "database.command",
            DatabaseOp::CommandGremlin => "database.command.gremlin",
            DatabaseOp::Freeze => "database.freeze",
            DatabaseOp::Release => "database.release",
            DatabaseOp::Passthrough => "database.passthrough",
            DatabaseOp::BypassRestricted => "database.bypassRestricted",
            DatabaseOp::RecordHook => "database.hook.record",
            DatabaseOp::SystemClusters => "database.systemclusters",
        }
    }

    pub fn generic(self) -> ResourceGeneric {
        match self {
            DatabaseOp::Database => ResourceGeneric::Database,
            DatabaseOp::Create => ResourceGeneric::DatabaseCreate,
            DatabaseOp::Copy => ResourceGeneric::DatabaseCopy,
            DatabaseOp::Drop => ResourceGeneric::DatabaseDrop,
            DatabaseOp::Exists => ResourceGeneric::DatabaseExists,
            DatabaseOp::Command => ResourceGeneric::Command,
            DatabaseOp::CommandGremlin => ResourceGeneric::CommandGremlin,
            DatabaseOp::Freeze => ResourceGeneric::DatabaseFreeze,
            DatabaseOp::Release => ResourceGeneric::DatabaseRelease,
            DatabaseOp::Passthrough => ResourceGeneric::DatabasePassthrough,
            DatabaseOp::BypassRestricted => ResourceGeneric::BypassRestricted,
            DatabaseOp::RecordHook => ResourceGeneric::RecordHook,
            DatabaseOp::SystemClusters => ResourceGeneric::SystemClusters,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ServerOp {
    Server,
    Status,
    Admin,
}

impl ServerOp {
    pub fn path(self) -> &'static str {
        match self {
            ServerOp::Server => "server",
            ServerOp::Status => "server.status",
            ServerOp::Admin => "server.admin",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Resource {
    All,
    Schema,
    Class(Target),
    Property { class: Target, property: Target },
    Function(Target),
    Cluster(Target),
    DatabaseOp(DatabaseOp),
    ServerOp(ServerOp),
}

impl Resource {
    pub fn class<S: Into<String>>(name: S) -> Resource { Resource::Class(Target::Named(name.into())) }
    pub fn property<C: Into<String>, P: Into<String>>(class: C, property: P) -> Resource {
        Resource::Property { class: Target::Named(class.into()), property: Target::Named(property.into()) }
    }
    pub fn function<S: Into<String>>(name: S) -> Resource { Resource::Function(Target::Named(name.into())) }

    /// Case-insensitive map key; policies are attached and looked up by it.
    pub fn key(&self) -> String { self.to_string().to_ascii_lowercase() }

    /// Parses without memoization. See [`ResourceResolver::resolve`].
    pub fn parse(text: &str) -> SecurityResult<Resource> {
        let t = text.trim();
        if let Some(r) = literal(t) { return Ok(r); }
        let segs = split_path(t).map_err(|e| SecurityError::invalid_resource(text, e))?;
        let segs: Vec<&str> = segs.iter().map(|s| s.as_str()).collect();
        let parsed = match segs.as_slice() {
            [db, kind, name] if db.eq_ignore_ascii_case("database") && kind.eq_ignore_ascii_case("class") => Resource::Class(Target::parse(name)),
            [db, kind, class, prop] if db.eq_ignore_ascii_case("database") && kind.eq_ignore_ascii_case("class") => {
                Resource::Property { class: Target::parse(class), property: Target::parse(prop) }
            }
            [db, kind, name] if db.eq_ignore_ascii_case("database") && kind.eq_ignore_ascii_case("cluster") => Resource::Cluster(Target::parse(name)),
            [db, kind, name] if db.eq_ignore_ascii_case("database") && kind.eq_ignore_ascii_case("function") => Resource::Function(Target::parse(name)),
            _ => return Err(SecurityError::invalid_resource(text, anyhow!("unrecognized resource path"))),
        };
        Ok(parsed)
    }
}

impl fmt::Display for Resource {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Resource::All => f.write_str("*"),
            Resource::Schema => f.write_str("database.schema"),
            Resource::Class(t) => write!(f, "database.class.{}", t),
            Resource::Property { class, property } => write!(f, "database.class.{}.{}", class, property),
            Resource::Function(t) => write!(f, "database.function.{}", t),
            Resource::Cluster(t) => write!(f, "database.cluster.{}", t),
            Resource::DatabaseOp(op) => f.write_str(op.path()),
            Resource::ServerOp(op) => f.write_str(op.path()),
        }
    }
}

fn literal(t: &str) -> Option<Resource> {
    match t {
        "*" => return Some(Resource::All),
        "database.schema" => return Some(Resource::Schema),
        "database.class.*" => return Some(Resource::Class(Target::Any)),
        "database.class.*.*" => return Some(Resource::Property { class: Target::Any, property: Target::Any }),
        "database.cluster.*" => return Some(Resource::Cluster(Target::Any)),
        "database.function.*" => return Some(Resource::Function(Target::Any)),
        _ => {}
    }
    if let Some(op) = DatabaseOp::ALL.iter().copied().find(|op| op.path().eq_ignore_ascii_case(t)) {
        return Some(Resource::DatabaseOp(op));
    }
    [ServerOp::Server, ServerOp::Status, ServerOp::Admin]
        .into_iter()
        .find(|op| op.path().eq_ignore_ascii_case(t))
        .map(Resource::ServerOp)
}

// Dot-separated segments; backticks quote a segment that itself contains dots.
fn split_path(t: &str) -> anyhow::Result<Vec<String>> {
    let mut out = Vec::new();
    let mut cur = String::new();
    let mut quoted = false;
    let mut chars = t.chars().peekable();
    while let Some(c) = chars.next() {
        match c {
            '\\' if quoted && chars.peek() == Some(&'`') => {
                cur.push('`');
                chars.next();
            }
            '`' => quoted = !quoted,
            '.' if !quoted => {
                if cur.is_empty() { return Err(anyhow!("empty path segment")); }
                out.push(std::mem::take(&mut cur));
            }
            _ => cur.push(c),
        }
    }
    if quoted { return Err(anyhow!("unterminated quoted segment")); }
    if cur.is_empty() { return Err(anyhow!("empty path segment")); }
    out.push(cur);
    Ok(out)
}

/// Memoizing resolver scoped to one security service instance.
#[derive(Default)]
pub struct ResourceResolver {
    cache: RwLock<HashMap<String, Arc<Resource>>>,
}

impl ResourceResolver {
    pub fn new() -> Self { Self::default() }

    pub fn resolve(&self, text: &str) -> SecurityResult<Arc<Resource>> {
        if let Some(hit) = self.cache.read().get(text) { return Ok(hit.clone()); }
        let parsed = Arc::new(Resource::parse(text)?);
        let mut w = self.cache.write();
        Ok(w.entry(text.to_string()).or_insert(parsed).clone())
    }

    pub fn len(&self) -> usize { self.cache.read().len() }
    pub fn is_empty(&self) -> bool { self.cache.read().is_empty() }
    pub fn clear(&self) { self.cache.write().clear(); }
}
