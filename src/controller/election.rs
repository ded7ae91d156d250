//! Primary election

use std::collections::BTreeMap;

use crate::controller::error::{Error, Result};
use crate::crd::PostgreSQLNode;

/// Pick the node that should become primary.
///
/// The highest priority wins. Among equal priorities the lexicographically
/// first name wins, so the result never depends on map iteration order.
pub fn select_primary(nodes: &BTreeMap<String, PostgreSQLNode>) -> Result<(&str, &PostgreSQLNode)> {
    let mut names: Vec<&String> = nodes.keys().collect();
    names.sort();

    let mut best: Option<(&str, &PostgreSQLNode)> = None;
    for name in names {
        let node = &nodes[name];
        match best {
            Some((_, current)) if node.priority <= current.priority => {}
            _ => best = Some((name.as_str(), node)),
        }
    }

    best.ok_or(Error::EmptySpecError)
}
