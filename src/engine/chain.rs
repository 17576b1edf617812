//! Chain validation
//!
//! `next_strategy_id` edges form a directed graph; a forward walk from
//! the mutated strategy must never revisit an id. Walk depth is bounded
//! by the total number of strategies.

use std::collections::{HashMap, HashSet};

use crate::error::{EngineError, EngineResult};

/// Check that pointing `mutated` at `new_next` keeps the graph acyclic.
/// `edges` is the current `(id, next_strategy_id)` set from the store.
pub fn validate_chain_edit(
    edges: &[(String, Option<String>)],
    mutated: &str,
    new_next: Option<&str>,
) -> EngineResult<()> {
    let mutated = mutated.to_lowercase();
    let Some(new_next) = new_next else {
        return Ok(());
    };
    let new_next = new_next.to_lowercase();
    if new_next == mutated {
        return Err(EngineError::CycleDetected(format!(
            "strategy {mutated} cannot chain to itself"
        )));
    }

    let mut next_of: HashMap<String, String> = edges
        .iter()
        .filter_map(|(id, next)| {
            next.as_ref()
                .map(|n| (id.to_lowercase(), n.to_lowercase()))
        })
        .collect();
    next_of.insert(mutated.clone(), new_next);

    let bound = edges.len() + 1;
    let mut visited = HashSet::new();
    let mut cursor = mutated.clone();
    visited.insert(cursor.clone());
    for _ in 0..bound {
        let Some(next) = next_of.get(&cursor) else {
            return Ok(());
        };
        if !visited.insert(next.clone()) {
            return Err(EngineError::CycleDetected(format!(
                "chain from {mutated} revisits {next}"
            )));
        }
        cursor = next.clone();
    }
    Ok(())
}
