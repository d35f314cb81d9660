//! Bounded def/use program slicing.
//!
//! A k-hop BFS over per-line def/use sets: forward slices chase variables
//! defined on frontier lines into their uses, backward slices chase used
//! variables into their definitions. Scope limiting restricts propagation to
//! the scopes of the original seed lines.

use std::collections::{BTreeSet, HashMap, HashSet};

use super::analysis::{ScopeKind, SourceAnalysis};

/// Slicing direction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Direction {
    Forward,
    Backward,
}

/// k-hop slice over the def/use relation.
pub fn slice_k(
    seeds: &BTreeSet<usize>,
    defs: &HashMap<usize, HashSet<String>>,
    uses: &HashMap<usize, HashSet<String>>,
    line_scope: &HashMap<usize, (ScopeKind, String)>,
    k: usize,
    direction: Direction,
    limit_scope: bool,
) -> BTreeSet<usize> {
    let target_scopes: Option<HashSet<&(ScopeKind, String)>> = if limit_scope {
        Some(seeds.iter().filter_map(|line| line_scope.get(line)).collect())
    } else {
        None
    };

    let mut affected: BTreeSet<usize> = seeds.clone();
    let mut frontier: BTreeSet<usize> = seeds.clone();

    let all_lines: BTreeSet<usize> = defs.keys().chain(uses.keys()).copied().collect();

    for _ in 0..k {
        let mut vars_of_interest: HashSet<&String> = HashSet::new();
        for line in &frontier {
            let source = match direction {
                Direction::Forward => defs.get(line),
                Direction::Backward => uses.get(line),
            };
            if let Some(vars) = source {
                vars_of_interest.extend(vars);
            }
        }

        let mut next_frontier = BTreeSet::new();
        for line in &all_lines {
            if affected.contains(line) {
                continue;
            }
            if let Some(scopes) = &target_scopes {
                match line_scope.get(line) {
                    Some(scope) if scopes.contains(scope) => {}
                    _ => continue,
                }
            }

            let candidates = match direction {
                Direction::Forward => uses.get(line),
                Direction::Backward => defs.get(line),
            };
            let hit = candidates
                .map(|vars| vars.iter().any(|v| vars_of_interest.contains(v)))
                .unwrap_or(false);
            if hit {
                affected.insert(*line);
                next_frontier.insert(*line);
            }
        }

        frontier = next_frontier;
        if frontier.is_empty() {
            break;
        }
    }

    affected
}

/// The two slices the must-cover engine records: a shallow unscoped slice
/// around every modified line, and a deep scoped slice around the
/// semantically significant seeds.
pub fn compute_patch_slices(analysis: &SourceAnalysis) -> (BTreeSet<usize>, BTreeSet<usize>) {
    let full_forward = slice_k(
        &analysis.modified_lines,
        &analysis.defs,
        &analysis.uses,
        &analysis.line_to_scope,
        1,
        Direction::Forward,
        false,
    );
    let full_backward = slice_k(
        &analysis.modified_lines,
        &analysis.defs,
        &analysis.uses,
        &analysis.line_to_scope,
        1,
        Direction::Backward,
        false,
    );

    let seeds = analysis.filtered_seeds();
    let scoped_forward = slice_k(
        &seeds,
        &analysis.defs,
        &analysis.uses,
        &analysis.line_to_scope,
        5,
        Direction::Forward,
        true,
    );
    let scoped_backward = slice_k(
        &seeds,
        &analysis.defs,
        &analysis.uses,
        &analysis.line_to_scope,
        5,
        Direction::Backward,
        true,
    );

    let full: BTreeSet<usize> = full_forward.union(&full_backward).copied().collect();
    let scoped: BTreeSet<usize> = scoped_forward.union(&scoped_backward).copied().collect();
    (scoped, full)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn vars(names: &[&str]) -> HashSet<String> {
        names.iter().map(|s| s.to_string()).collect()
    }

    fn scope(kind: ScopeKind, name: &str) -> (ScopeKind, String) {
        (kind, name.to_string())
    }

    /// Small program:
    /// 1: x = 1        (global)
    /// 2: def f():     (f)
    /// 3:   y = x      (f)
    /// 4:   return y   (f)
    /// 5: z = f()      (global)
    fn fixture() -> (
        HashMap<usize, HashSet<String>>,
        HashMap<usize, HashSet<String>>,
        HashMap<usize, (ScopeKind, String)>,
    ) {
        let mut defs = HashMap::new();
        defs.insert(1, vars(&["x"]));
        defs.insert(3, vars(&["y"]));
        defs.insert(5, vars(&["z"]));
        let mut uses = HashMap::new();
        uses.insert(3, vars(&["x"]));
        uses.insert(4, vars(&["y"]));
        uses.insert(5, vars(&["f"]));
        let mut scopes = HashMap::new();
        scopes.insert(1, scope(ScopeKind::Global, "__global__"));
        scopes.insert(2, scope(ScopeKind::Function, "global.f"));
        scopes.insert(3, scope(ScopeKind::Function, "global.f"));
        scopes.insert(4, scope(ScopeKind::Function, "global.f"));
        scopes.insert(5, scope(ScopeKind::Global, "__global__"));
        (defs, uses, scopes)
    }

    #[test]
    fn test_forward_one_hop() {
        let (defs, uses, scopes) = fixture();
        let seeds: BTreeSet<usize> = [1].into_iter().collect();
        let sliced = slice_k(&seeds, &defs, &uses, &scopes, 1, Direction::Forward, false);
        // x defined on 1 is used on 3.
        assert_eq!(sliced, [1, 3].into_iter().collect());
    }

    #[test]
    fn test_forward_two_hops() {
        let (defs, uses, scopes) = fixture();
        let seeds: BTreeSet<usize> = [1].into_iter().collect();
        let sliced = slice_k(&seeds, &defs, &uses, &scopes, 2, Direction::Forward, false);
        // Hop 2: y defined on 3 is used on 4.
        assert_eq!(sliced, [1, 3, 4].into_iter().collect());
    }

    #[test]
    fn test_backward_slice() {
        let (defs, uses, scopes) = fixture();
        let seeds: BTreeSet<usize> = [4].into_iter().collect();
        let sliced = slice_k(&seeds, &defs, &uses, &scopes, 1, Direction::Backward, false);
        // y used on 4 is defined on 3.
        assert_eq!(sliced, [3, 4].into_iter().collect());
    }

    #[test]
    fn test_scope_limiting() {
        let (defs, uses, scopes) = fixture();
        let seeds: BTreeSet<usize> = [3].into_iter().collect();
        // Without limiting, backward from 3 reaches the global def of x.
        let open = slice_k(&seeds, &defs, &uses, &scopes, 3, Direction::Backward, false);
        assert!(open.contains(&1));
        // With limiting, propagation stays inside global.f.
        let scoped = slice_k(&seeds, &defs, &uses, &scopes, 3, Direction::Backward, true);
        assert!(!scoped.contains(&1));
    }

    #[test]
    fn test_empty_seeds() {
        let (defs, uses, scopes) = fixture();
        let sliced = slice_k(
            &BTreeSet::new(),
            &defs,
            &uses,
            &scopes,
            5,
            Direction::Forward,
            false,
        );
        assert!(sliced.is_empty());
    }

    #[test]
    fn test_early_exit_when_frontier_drains() {
        let (defs, uses, scopes) = fixture();
        let seeds: BTreeSet<usize> = [5].into_iter().collect();
        // z is never used downstream: slice stops immediately.
        let sliced = slice_k(&seeds, &defs, &uses, &scopes, 10, Direction::Forward, false);
        assert_eq!(sliced, seeds);
    }
}
