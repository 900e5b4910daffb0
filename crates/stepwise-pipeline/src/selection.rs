//! Step-selection queries and dependency walks over a plan's step deps.
//!
//! A query names one step key with optional operators on either side:
//!
//! - `a.compute` selects the step itself
//! - `*a.compute` adds all of its ancestors, `++a.compute` ancestors two levels up
//! - `a.compute*` adds all of its descendants, `a.compute+` its direct dependents

use std::collections::{BTreeMap, BTreeSet, VecDeque};
use std::sync::OnceLock;

use regex::Regex;
use stepwise_types::{Result, StepwiseError};

/// Step key -> upstream step keys.
pub type StepDeps = BTreeMap<String, BTreeSet<String>>;

fn clause_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"^(\*?\+*)([\w.\[\]?-]+?)(\+*\*?)$").expect("step selection regex is valid")
    })
}

/// How far a query reaches in one direction. `None` means unbounded.
fn parse_reach(part: &str) -> Option<usize> {
    if part.contains('*') {
        None
    } else {
        Some(part.chars().filter(|c| *c == '+').count())
    }
}

fn walk(
    edges: &BTreeMap<String, BTreeSet<String>>,
    key: &str,
    depth: Option<usize>,
) -> BTreeSet<String> {
    let mut seen = BTreeSet::from([key.to_string()]);
    let mut queue = VecDeque::from([(key.to_string(), 0usize)]);
    while let Some((current, level)) = queue.pop_front() {
        if depth.is_some_and(|d| level >= d) {
            continue;
        }
        let Some(next) = edges.get(&current) else {
            continue;
        };
        for n in next {
            if seen.insert(n.clone()) {
                queue.push_back((n.clone(), level + 1));
            }
        }
    }
    seen
}

/// `key` and its upstream steps up to `depth` levels. May include keys that
/// are only referenced as dependencies.
pub fn ancestors(deps: &StepDeps, key: &str, depth: Option<usize>) -> BTreeSet<String> {
    walk(deps, key, depth)
}

/// `key` and its downstream steps up to `depth` levels.
pub fn descendants(deps: &StepDeps, key: &str, depth: Option<usize>) -> BTreeSet<String> {
    let mut dependents: BTreeMap<String, BTreeSet<String>> = BTreeMap::new();
    for (step, upstream) in deps {
        for up in upstream {
            dependents
                .entry(up.clone())
                .or_default()
                .insert(step.clone());
        }
    }
    walk(&dependents, key, depth)
}

/// Resolve selection queries to the union of matching step keys.
///
/// Every query that is malformed or names no step in `deps` is reported in a
/// single [`StepwiseError::InvalidSubset`].
pub fn parse_step_selection(
    pipeline: &str,
    deps: &StepDeps,
    queries: &[String],
) -> Result<BTreeSet<String>> {
    let mut selected = BTreeSet::new();
    let mut unknown = Vec::new();

    for query in queries {
        let query = query.trim();
        let Some(caps) = clause_regex().captures(query) else {
            unknown.push(query.to_string());
            continue;
        };
        let key = &caps[2];
        if !deps.contains_key(key) {
            unknown.push(query.to_string());
            continue;
        }
        let up = parse_reach(&caps[1]);
        let down = parse_reach(&caps[3]);
        selected.extend(
            ancestors(deps, key, up)
                .into_iter()
                .filter(|k| deps.contains_key(k)),
        );
        selected.extend(descendants(deps, key, down));
    }

    if !unknown.is_empty() {
        return Err(StepwiseError::InvalidSubset {
            pipeline: pipeline.to_string(),
            unknown,
        });
    }
    Ok(selected)
}

#[cfg(test)]
mod tests {
    use super::*;

    /// a -> b -> c -> d, plus a -> e
    fn chain() -> StepDeps {
        let mut deps = StepDeps::new();
        deps.insert("a.compute".into(), BTreeSet::new());
        deps.insert("b.compute".into(), BTreeSet::from(["a.compute".into()]));
        deps.insert("c.compute".into(), BTreeSet::from(["b.compute".into()]));
        deps.insert("d.compute".into(), BTreeSet::from(["c.compute".into()]));
        deps.insert("e.compute".into(), BTreeSet::from(["a.compute".into()]));
        deps
    }

    fn select(queries: &[&str]) -> Result<Vec<String>> {
        let queries: Vec<String> = queries.iter().map(|q| q.to_string()).collect();
        parse_step_selection("p", &chain(), &queries).map(|s| s.into_iter().collect())
    }

    #[test]
    fn bare_key_selects_itself() {
        assert_eq!(select(&["c.compute"]).unwrap(), vec!["c.compute"]);
    }

    #[test]
    fn star_prefix_selects_all_ancestors() {
        assert_eq!(
            select(&["*c.compute"]).unwrap(),
            vec!["a.compute", "b.compute", "c.compute"]
        );
    }

    #[test]
    fn plus_limits_depth() {
        assert_eq!(select(&["+c.compute"]).unwrap(), vec!["b.compute", "c.compute"]);
        assert_eq!(select(&["b.compute+"]).unwrap(), vec!["b.compute", "c.compute"]);
        assert_eq!(
            select(&["a.compute++"]).unwrap(),
            vec!["a.compute", "b.compute", "c.compute", "e.compute"]
        );
    }

    #[test]
    fn star_suffix_selects_all_descendants() {
        assert_eq!(
            select(&["b.compute*"]).unwrap(),
            vec!["b.compute", "c.compute", "d.compute"]
        );
    }

    #[test]
    fn queries_union() {
        assert_eq!(
            select(&["d.compute", "e.compute"]).unwrap(),
            vec!["d.compute", "e.compute"]
        );
    }

    #[test]
    fn every_unknown_query_is_reported() {
        let err = select(&["ghost.compute", "a.compute", "*nope"]).unwrap_err();
        match err {
            StepwiseError::InvalidSubset { unknown, .. } => {
                assert_eq!(unknown, vec!["ghost.compute", "*nope"]);
            }
            other => panic!("expected InvalidSubset, got {other:?}"),
        }
    }

    #[test]
    fn ancestors_outside_deps_are_dropped_from_selection() {
        let mut deps = StepDeps::new();
        deps.insert("b.compute".into(), BTreeSet::from(["a.compute".into()]));
        let selected =
            parse_step_selection("p", &deps, &["*b.compute".to_string()]).unwrap();
        assert_eq!(selected, BTreeSet::from(["b.compute".to_string()]));
    }
}
