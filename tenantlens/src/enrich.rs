use std::collections::{BTreeMap, HashMap};

use tracing::debug;

/// Key to value mapping built once per request from a secondary fetch.
#[derive(Debug, Clone)]
pub struct LookupTable<V> {
    name: &'static str,
    case_insensitive: bool,
    entries: HashMap<String, V>,
}

impl<V> LookupTable<V> {
    pub fn new(name: &'static str) -> Self {
        Self {
            name,
            case_insensitive: false,
            entries: HashMap::new(),
        }
    }

    pub fn case_insensitive(name: &'static str) -> Self {
        Self {
            case_insensitive: true,
            ..Self::new(name)
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// First insert for a key wins.
    pub fn insert(&mut self, key: &str, value: V) {
        let key = self.normalize(key);
        self.entries.entry(key).or_insert(value);
    }

    /// Last insert for a key wins.
    pub fn replace(&mut self, key: &str, value: V) {
        let key = self.normalize(key);
        self.entries.insert(key, value);
    }

    pub fn get(&self, key: &str) -> Option<&V> {
        self.entries.get(&self.normalize(key))
    }

    /// Like `get`, but counts the miss.
    pub fn resolve(&self, key: &str, misses: &mut Misses) -> Option<&V> {
        let found = self.get(key);
        if found.is_none() {
            misses.record(self.name);
        }
        found
    }

    fn normalize(&self, key: &str) -> String {
        if self.case_insensitive {
            key.to_lowercase()
        } else {
            key.to_string()
        }
    }
}

impl<V> Extend<(String, V)> for LookupTable<V> {
    fn extend<I: IntoIterator<Item = (String, V)>>(&mut self, iter: I) {
        for (key, value) in iter {
            self.insert(&key, value);
        }
    }
}

/// Lookup misses per table for one merge.
#[derive(Debug, Default)]
pub struct Misses {
    counts: BTreeMap<&'static str, usize>,
}

impl Misses {
    pub fn record(&mut self, table: &'static str) {
        *self.counts.entry(table).or_default() += 1;
    }

    pub fn get(&self, table: &str) -> usize {
        self.counts.get(table).copied().unwrap_or(0)
    }

    pub fn total(&self) -> usize {
        self.counts.values().sum()
    }
}

/// Joins one primary record with the lookup tables it closes over.
pub trait Enrich<P> {
    type Output;

    fn enrich(&self, record: P, misses: &mut Misses) -> Self::Output;
}

/// One output per primary record, in input order. Misses are logged, never
/// raised.
pub fn merge<P, E>(primary: impl IntoIterator<Item = P>, enricher: &E) -> Vec<E::Output>
where
    E: Enrich<P>,
{
    let mut misses = Misses::default();
    let merged: Vec<E::Output> = primary
        .into_iter()
        .map(|record| enricher.enrich(record, &mut misses))
        .collect();
    for (table, count) in &misses.counts {
        debug!(table, misses = count, records = merged.len(), "lookup misses during enrichment");
    }
    merged
}
