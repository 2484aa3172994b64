//! Expression dependencies and circular reference detection.

use std::collections::{BTreeSet, HashSet};

/// Something an expression depends on.
///
/// The string form (`$id`, `time`, `time_ms`, `asap`) is what the scheduler
/// puts in its per-tick changed set.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum Dep {
    /// Value of another port (or of the owning port)
    Port(String),
    /// Fires once per wall-clock second
    Time,
    /// Fires on every tick
    TimeMs,
    /// Expression has no other deps and is evaluated on every tick
    Asap,
}

impl Dep {
    pub fn port(id: impl Into<String>) -> Self {
        Dep::Port(id.into())
    }

    /// Port id, if this is a port dependency
    pub fn port_id(&self) -> Option<&str> {
        match self {
            Dep::Port(id) => Some(id),
            _ => None,
        }
    }

    /// Whether this dep is produced by the tick itself rather than by a value change
    pub fn is_tick(&self) -> bool {
        matches!(self, Dep::Asap | Dep::TimeMs)
    }
}

impl std::fmt::Display for Dep {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Dep::Port(id) => write!(f, "${}", id),
            Dep::Time => f.write_str("time"),
            Dep::TimeMs => f.write_str("time_ms"),
            Dep::Asap => f.write_str("asap"),
        }
    }
}

pub type DepSet = BTreeSet<Dep>;

/// Look for a reference path leading from `origin` back to itself.
///
/// `deps_of` returns the port deps of the expression held by a port, or `None`
/// if the port has no expression. `origin_deps` are the deps of the expression
/// being installed on `origin`. A port referencing itself directly is not a loop.
///
/// Returns the offending path (starting at `origin`) when a loop exists.
pub fn find_loop<F>(origin: &str, origin_deps: &DepSet, mut deps_of: F) -> Option<Vec<String>>
where
    F: FnMut(&str) -> Option<DepSet>,
{
    let mut visited = HashSet::new();
    let mut path = vec![origin.to_string()];

    for dep in origin_deps {
        if let Some(id) = dep.port_id() {
            if id == origin {
                continue;
            }
            if walk(origin, id, &mut deps_of, &mut visited, &mut path) {
                return Some(path);
            }
        }
    }

    None
}

fn walk<F>(
    origin: &str,
    current: &str,
    deps_of: &mut F,
    visited: &mut HashSet<String>,
    path: &mut Vec<String>,
) -> bool
where
    F: FnMut(&str) -> Option<DepSet>,
{
    path.push(current.to_string());

    if current == origin {
        return true;
    }
    if !visited.insert(current.to_string()) {
        path.pop();
        return false;
    }

    if let Some(deps) = deps_of(current) {
        for dep in &deps {
            if let Some(id) = dep.port_id() {
                if id == current && id != origin {
                    continue;
                }
                if walk(origin, id, deps_of, visited, path) {
                    return true;
                }
            }
        }
    }

    path.pop();
    false
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn set(items: &[&str]) -> DepSet {
        items.iter().map(|s| Dep::port(*s)).collect()
    }

    #[test]
    fn test_dep_display() {
        assert_eq!(Dep::port("nid1").to_string(), "$nid1");
        assert_eq!(Dep::Time.to_string(), "time");
        assert_eq!(Dep::TimeMs.to_string(), "time_ms");
        assert_eq!(Dep::Asap.to_string(), "asap");
    }

    #[test]
    fn test_direct_loop() {
        let mut graph = HashMap::new();
        graph.insert("a", set(&["b"]));

        let path = find_loop("b", &set(&["a"]), |id| graph.get(id).cloned());
        assert_eq!(path, Some(vec!["b".to_string(), "a".to_string(), "b".to_string()]));
    }

    #[test]
    fn test_self_reference_is_not_a_loop() {
        let path = find_loop("a", &set(&["a"]), |_| None);
        assert!(path.is_none());
    }

    #[test]
    fn test_indirect_loop_and_diamond() {
        let mut graph = HashMap::new();
        graph.insert("b", set(&["c", "d"]));
        graph.insert("c", set(&["d"]));
        graph.insert("d", set(&["x"]));

        // Diamond without a cycle
        assert!(find_loop("a", &set(&["b"]), |id| graph.get(id).cloned()).is_none());

        // d now points back at a
        graph.insert("d", set(&["a"]));
        let path = find_loop("a", &set(&["b"]), |id| graph.get(id).cloned()).unwrap();
        assert_eq!(path.first().map(String::as_str), Some("a"));
        assert_eq!(path.last().map(String::as_str), Some("a"));
    }
}
