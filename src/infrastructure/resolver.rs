use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock};

use serde_json::Value;
use tracing::{debug, warn};

use crate::config::ConflictConfig;
use crate::core::clock::{ClockOrdering, VectorClock};
use crate::core::path::Path;
use crate::core::record::Record;
use crate::error::{MeshError, MeshResult};

/// Named conflict strategies.
///
/// All strategies agree on causally ordered records: the dominant clock
/// wins and identical clocks keep the current record. They differ only in
/// how a concurrent pair is settled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Strategy {
    VectorDominance,
    LastWriteWins,
    FirstWriteWins,
    MergeFields,
}

impl Strategy {
    pub fn parse(name: &str) -> MeshResult<Self> {
        match name {
            "vector-dominance" => Ok(Strategy::VectorDominance),
            "last-write-wins" => Ok(Strategy::LastWriteWins),
            "first-write-wins" => Ok(Strategy::FirstWriteWins),
            "merge-fields" => Ok(Strategy::MergeFields),
            "custom" => Err(MeshError::UnknownStrategy(
                "custom resolvers are registered through the API, not by name".to_string(),
            )),
            other => Err(MeshError::UnknownStrategy(other.to_string())),
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            Strategy::VectorDominance => "vector-dominance",
            Strategy::LastWriteWins => "last-write-wins",
            Strategy::FirstWriteWins => "first-write-wins",
            Strategy::MergeFields => "merge-fields",
        }
    }
}

/// User-supplied resolver: `(path, local, remote) -> surviving record`.
pub type CustomResolver = Arc<dyn Fn(&Path, &Record, &Record) -> Record + Send + Sync>;

enum StrategySpec {
    Named(Strategy),
    Custom(CustomResolver),
}

impl std::fmt::Debug for StrategySpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StrategySpec::Named(strategy) => write!(f, "Named({})", strategy.name()),
            StrategySpec::Custom(_) => write!(f, "Custom(..)"),
        }
    }
}

/// Outcome of resolving an incoming record against the current one.
#[derive(Debug, Clone)]
pub struct Resolution {
    /// The record to commit; its clock is always `local ∪ remote`.
    pub record: Record,
    /// The commit would change the stored record in any way (payload or
    /// clock). `false` means the apply is a no-op.
    pub changed: bool,
    /// The visible payload changed, so subscribers should fire.
    pub payload_changed: bool,
}

/// Per-path-prefix conflict resolution.
///
/// The prefix table holds named strategies and custom functions together;
/// the longest matching prefix wins, and paths with no match use the
/// default strategy.
#[derive(Debug)]
pub struct ConflictResolver {
    default_strategy: Strategy,
    prefixes: RwLock<Vec<(String, StrategySpec)>>,
}

impl ConflictResolver {
    pub fn from_config(config: &ConflictConfig) -> MeshResult<Self> {
        let default_strategy = Strategy::parse(&config.default_strategy)
            .map_err(|e| MeshError::Config(e.to_string()))?;
        let mut prefixes = Vec::new();
        for (prefix, name) in &config.path_strategies {
            let strategy =
                Strategy::parse(name).map_err(|e| MeshError::Config(e.to_string()))?;
            prefixes.push((prefix.clone(), StrategySpec::Named(strategy)));
        }
        Ok(Self {
            default_strategy,
            prefixes: RwLock::new(prefixes),
        })
    }

    pub fn set_strategy(&self, prefix: &str, name: &str) -> MeshResult<()> {
        let strategy = Strategy::parse(name)?;
        self.upsert(prefix, StrategySpec::Named(strategy));
        Ok(())
    }

    pub fn register_custom(&self, prefix: &str, resolver: CustomResolver) {
        self.upsert(prefix, StrategySpec::Custom(resolver));
    }

    fn upsert(&self, prefix: &str, spec: StrategySpec) {
        let mut prefixes = self.prefixes.write().unwrap();
        if let Some(entry) = prefixes.iter_mut().find(|(p, _)| p == prefix) {
            entry.1 = spec;
        } else {
            prefixes.push((prefix.to_string(), spec));
        }
    }

    /// Resolve `remote` against the current record. Callers hold the
    /// per-path lock, so decisions are deterministic for any interleaving.
    pub fn resolve(&self, path: &Path, local: Option<&Record>, remote: &Record) -> Resolution {
        let local = match local {
            Some(local) => local,
            None => {
                // First write for this path.
                return Resolution {
                    record: remote.clone(),
                    changed: true,
                    payload_changed: true,
                };
            }
        };

        let merged_clock = local.vector_clock.merged(&remote.vector_clock);
        let winner = match local.vector_clock.compare(&remote.vector_clock) {
            ClockOrdering::After | ClockOrdering::Identical => local.clone(),
            ClockOrdering::Before => remote.clone(),
            ClockOrdering::Concurrent => self.settle_concurrent(path, local, remote),
        };

        let mut record = winner;
        if record.vector_clock != merged_clock {
            record.vector_clock = merged_clock;
        }

        let changed = record != *local;
        let payload_changed = record.msg_id != local.msg_id
            || record.value != local.value
            || record.deleted != local.deleted;
        Resolution {
            record,
            changed,
            payload_changed,
        }
    }

    fn settle_concurrent(&self, path: &Path, local: &Record, remote: &Record) -> Record {
        match self.strategy_for(path) {
            StrategySpec::Custom(resolver) => {
                let outcome = catch_unwind(AssertUnwindSafe(|| resolver(path, local, remote)));
                match outcome {
                    Ok(record) => record,
                    Err(_) => {
                        warn!(
                            "custom resolver for '{}' panicked; falling back to vector-dominance",
                            path
                        );
                        self.pick_side(Strategy::VectorDominance, local, remote)
                    }
                }
            }
            StrategySpec::Named(Strategy::MergeFields) => self.merge_fields(path, local, remote),
            StrategySpec::Named(strategy) => self.pick_side(strategy, local, remote),
        }
    }

    fn strategy_for(&self, path: &Path) -> StrategySpec {
        let prefixes = self.prefixes.read().unwrap();
        let best = prefixes
            .iter()
            .filter(|(prefix, _)| path.is_under(prefix))
            .max_by_key(|(prefix, _)| prefix.len());
        match best {
            Some((_, StrategySpec::Named(strategy))) => StrategySpec::Named(*strategy),
            Some((_, StrategySpec::Custom(resolver))) => StrategySpec::Custom(resolver.clone()),
            None => StrategySpec::Named(self.default_strategy),
        }
    }

    fn pick_side(&self, strategy: Strategy, local: &Record, remote: &Record) -> Record {
        if Self::local_wins_concurrent(strategy, local, remote) {
            local.clone()
        } else {
            remote.clone()
        }
    }

    fn local_wins_concurrent(strategy: Strategy, local: &Record, remote: &Record) -> bool {
        match strategy {
            Strategy::VectorDominance | Strategy::MergeFields => {
                VectorClock::deterministic_winner(&local.tie_tag(), &remote.tie_tag())
            }
            Strategy::LastWriteWins => {
                if local.timestamp != remote.timestamp {
                    local.timestamp > remote.timestamp
                } else {
                    VectorClock::deterministic_winner(&local.tie_tag(), &remote.tie_tag())
                }
            }
            // Lower timestamp wins, then the tie-break runs reversed so the
            // two timestamp strategies never coincide on concurrent input.
            Strategy::FirstWriteWins => {
                if local.timestamp != remote.timestamp {
                    local.timestamp < remote.timestamp
                } else {
                    !VectorClock::deterministic_winner(&local.tie_tag(), &remote.tie_tag())
                }
            }
        }
    }

    /// Recursive field union of two map payloads. Non-mergeable pairs
    /// (tombstones, scalars, arrays, map-vs-non-map) fall back to the
    /// default strategy; a merge-fields default falls back to
    /// vector-dominance to stay well-founded.
    fn merge_fields(&self, path: &Path, local: &Record, remote: &Record) -> Record {
        let fallback = match self.default_strategy {
            Strategy::MergeFields => Strategy::VectorDominance,
            other => other,
        };
        let local_wins = Self::local_wins_concurrent(fallback, local, remote);

        if local.deleted || remote.deleted {
            return self.pick_side(fallback, local, remote);
        }
        if !local.value.is_object() || !remote.value.is_object() {
            return self.pick_side(fallback, local, remote);
        }

        let merged_value = merge_values(&local.value, &remote.value, local_wins);
        // The merged payload carries the identity of the fallback winner.
        let identity = if local_wins { local } else { remote };
        debug!("field-merged concurrent records at '{}'", path);
        Record {
            value: merged_value,
            vector_clock: identity.vector_clock.clone(),
            origin: identity.origin.clone(),
            timestamp: identity.timestamp,
            msg_id: identity.msg_id.clone(),
            deleted: false,
        }
    }
}

/// Field union: recurse where both sides are maps, keep single-sided keys,
/// and let the precomputed winner settle scalar conflicts. Arrays and
/// scalars are never element-merged.
fn merge_values(local: &Value, remote: &Value, local_wins: bool) -> Value {
    match (local, remote) {
        (Value::Object(local_map), Value::Object(remote_map)) => {
            let mut merged = serde_json::Map::new();
            for (key, local_value) in local_map {
                match remote_map.get(key) {
                    Some(remote_value) => {
                        merged.insert(
                            key.clone(),
                            merge_values(local_value, remote_value, local_wins),
                        );
                    }
                    None => {
                        merged.insert(key.clone(), local_value.clone());
                    }
                }
            }
            for (key, remote_value) in remote_map {
                if !local_map.contains_key(key) {
                    merged.insert(key.clone(), remote_value.clone());
                }
            }
            Value::Object(merged)
        }
        _ => {
            if local_wins {
                local.clone()
            } else {
                remote.clone()
            }
        }
    }
}
