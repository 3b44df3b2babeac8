//! Parent/child lookups through the relationship cache.
//!
//! A lookup tries each [`Strategy`] in order until one produces an answer.
//! The server-side query is authoritative, so its empty answers are cached;
//! the traversal fallback only caches what it actually found.

use std::collections::{HashSet, VecDeque};

use serde::Serialize;

use crate::cache::{CacheKey, Clock, RelationshipCache};
use crate::domain::{DatasetCode, RelationKind, RelationshipRecord};
use crate::error::ObisError;
use crate::openbis::OpenbisClient;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Strategy {
    ServerQuery,
    ObjectTraversal,
}

pub const STRATEGIES: [Strategy; 2] = [Strategy::ServerQuery, Strategy::ObjectTraversal];

#[derive(Debug)]
pub enum Outcome {
    Found(Vec<RelationshipRecord>),
    Empty,
    Failed(ObisError),
}

impl Outcome {
    fn from_result(result: Result<Vec<RelationshipRecord>, ObisError>) -> Self {
        match result {
            Ok(records) if records.is_empty() => Outcome::Empty,
            Ok(records) => Outcome::Found(records),
            Err(err) => Outcome::Failed(err),
        }
    }
}

impl Strategy {
    pub fn attempt<C: OpenbisClient + ?Sized>(
        &self,
        client: &C,
        code: &DatasetCode,
        kind: RelationKind,
    ) -> Outcome {
        match self {
            Strategy::ServerQuery => Outcome::from_result(client.query_related(code, kind)),
            Strategy::ObjectTraversal => Outcome::from_result(client.traverse_related(code, kind)),
        }
    }

    fn caches_empty(&self) -> bool {
        matches!(self, Strategy::ServerQuery)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum LookupSource {
    Cache,
    Strategy(Strategy),
    Unavailable,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Lookup {
    pub records: Vec<RelationshipRecord>,
    pub source: LookupSource,
}

pub fn lookup<C, K>(
    client: &C,
    cache: &mut RelationshipCache<K>,
    code: &DatasetCode,
    kind: RelationKind,
) -> Lookup
where
    C: OpenbisClient + ?Sized,
    K: Clock,
{
    let key = CacheKey::new(kind, code);
    if let Some(records) = cache.get(&key) {
        tracing::debug!(%key, count = records.len(), "relationship cache hit");
        return Lookup {
            records: records.to_vec(),
            source: LookupSource::Cache,
        };
    }

    for strategy in STRATEGIES {
        match strategy.attempt(client, code, kind) {
            Outcome::Found(records) => {
                cache.put(key, records.clone());
                return Lookup {
                    records,
                    source: LookupSource::Strategy(strategy),
                };
            }
            Outcome::Empty => {
                if strategy.caches_empty() {
                    cache.put(key, Vec::new());
                }
                return Lookup {
                    records: Vec::new(),
                    source: LookupSource::Strategy(strategy),
                };
            }
            Outcome::Failed(err) => {
                tracing::warn!(%key, ?strategy, %err, "relationship lookup failed");
            }
        }
    }

    tracing::warn!(%key, "no relationship strategy succeeded; returning empty result");
    Lookup {
        records: Vec::new(),
        source: LookupSource::Unavailable,
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RelationEdge {
    pub from: String,
    pub kind: RelationKind,
    pub depth: usize,
    pub record: RelationshipRecord,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RelationGraph {
    pub root: String,
    pub edges: Vec<RelationEdge>,
    /// Lookups that ended with no strategy succeeding.
    pub unresolved: Vec<String>,
}

/// Breadth-first walk over `kinds` up to `max_depth` hops from `root`.
///
/// Each dataset is expanded at most once per kind, so cycles terminate.
pub fn walk<C, K>(
    client: &C,
    cache: &mut RelationshipCache<K>,
    root: &DatasetCode,
    kinds: &[RelationKind],
    max_depth: usize,
) -> RelationGraph
where
    C: OpenbisClient + ?Sized,
    K: Clock,
{
    let mut graph = RelationGraph {
        root: root.to_string(),
        ..RelationGraph::default()
    };

    for &kind in kinds {
        let mut visited = HashSet::from([root.clone()]);
        let mut queue = VecDeque::from([(root.clone(), 1usize)]);

        while let Some((code, depth)) = queue.pop_front() {
            if depth > max_depth {
                continue;
            }
            let found = lookup(client, cache, &code, kind);
            if found.source == LookupSource::Unavailable {
                graph.unresolved.push(CacheKey::new(kind, &code).to_string());
            }
            for record in found.records {
                match record.code.parse::<DatasetCode>() {
                    Ok(next) if visited.insert(next.clone()) => queue.push_back((next, depth + 1)),
                    Ok(_) => {}
                    Err(err) => tracing::debug!(%err, "skipping related record"),
                }
                graph.edges.push(RelationEdge {
                    from: code.to_string(),
                    kind,
                    depth,
                    record,
                });
            }
        }
    }
    graph
}
