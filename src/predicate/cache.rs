//! Bounded LRU cache of parsed predicates keyed by their source text.

use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

use super::{Predicate, PredicateParser};

pub struct PredicateCache {
    entries: Option<Mutex<LruCache<String, Predicate>>>,
}

impl PredicateCache {
    /// A capacity of zero disables caching; every lookup parses.
    pub fn new(capacity: usize) -> Self {
        Self { entries: NonZeroUsize::new(capacity).map(|cap| Mutex::new(LruCache::new(cap))) }
    }

    /// Parsed predicate for `text`. `"true"`/`"false"` (any case) never reach the parser.
    /// Callers receive an independent copy; only cacheable predicates are retained.
    pub fn parse(&self, text: &str, parser: &dyn PredicateParser) -> anyhow::Result<Predicate> {
        let trimmed = text.trim();
        if trimmed.eq_ignore_ascii_case("true") { return Ok(Predicate::True); }
        if trimmed.eq_ignore_ascii_case("false") { return Ok(Predicate::False); }

        if let Some(m) = &self.entries {
            if let Some(hit) = m.lock().get(text) { return Ok(hit.clone()); }
        }
        let parsed = Predicate::Expr(parser.parse(text)?);
        if let Some(m) = &self.entries {
            if parsed.is_cacheable() {
                m.lock().put(text.to_string(), parsed.clone());
            }
        }
        Ok(parsed)
    }

    pub fn clear(&self) {
        if let Some(m) = &self.entries { m.lock().clear(); }
    }

    pub fn len(&self) -> usize { self.entries.as_ref().map(|m| m.lock().len()).unwrap_or(0) }
    pub fn is_empty(&self) -> bool { self.len() == 0 }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::predicate::basic::BasicPredicateParser;
    use crate::predicate::Expression;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[derive(Default)]
    struct Counting {
        calls: AtomicUsize,
    }

    impl PredicateParser for Counting {
        fn parse(&self, text: &str) -> anyhow::Result<Box<dyn Expression>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            BasicPredicateParser.parse(text)
        }
    }

    #[test]
    fn literals_skip_the_parser() {
        let cache = PredicateCache::new(8);
        let p = Counting::default();
        assert!(cache.parse("true", &p).unwrap().is_true());
        assert!(cache.parse("TRUE", &p).unwrap().is_true());
        assert!(cache.parse(" false ", &p).unwrap().is_false());
        assert_eq!(p.calls.load(Ordering::SeqCst), 0);
        assert!(cache.is_empty());
    }

    #[test]
    fn repeated_text_parses_once() {
        let cache = PredicateCache::new(8);
        let p = Counting::default();
        cache.parse("owner = $currentUser", &p).unwrap();
        cache.parse("owner = $currentUser", &p).unwrap();
        assert_eq!(p.calls.load(Ordering::SeqCst), 1);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn non_cacheable_predicates_are_not_retained() {
        let cache = PredicateCache::new(8);
        let p = Counting::default();
        cache.parse("tenant = $tenant", &p).unwrap();
        cache.parse("tenant = $tenant", &p).unwrap();
        assert_eq!(p.calls.load(Ordering::SeqCst), 2);
        assert!(cache.is_empty());
    }

    #[test]
    fn eviction_and_zero_capacity() {
        let cache = PredicateCache::new(2);
        let p = Counting::default();
        for t in ["a = 1", "b = 1", "c = 1"] { cache.parse(t, &p).unwrap(); }
        assert_eq!(cache.len(), 2);
        cache.parse("a = 1", &p).unwrap();
        assert_eq!(p.calls.load(Ordering::SeqCst), 4);

        let off = PredicateCache::new(0);
        off.parse("a = 1", &p).unwrap();
        off.parse("a = 1", &p).unwrap();
        assert_eq!(p.calls.load(Ordering::SeqCst), 6);
        assert_eq!(off.len(), 0);
    }

    #[test]
    fn parse_errors_propagate() {
        let cache = PredicateCache::new(4);
        assert!(cache.parse("a = ", &BasicPredicateParser).is_err());
        assert!(cache.is_empty());
    }
}
