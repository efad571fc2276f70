// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Result clustering (ch. 4.7).
//!
//! Groups clients by `Result` equality, preserving first-seen insertion
//! order the way the source's `dict`-keyed clustering does (iteration
//! order there follows first insertion).

use crate::wire::{FilteredResult, Result};

const SIGILL: u8 = 4;

pub trait HasSignum {
    fn signum(&self) -> u8;
}

impl HasSignum for Result {
    fn signum(&self) -> u8 {
        self.signum
    }
}

impl<'a> HasSignum for FilteredResult<'a> {
    fn signum(&self) -> u8 {
        self.result.signum
    }
}

/// Groups `items` by `eq`, in first-seen order.
pub fn cluster_with<'a, C: Clone, T>(items: &'a [(C, T)], eq: impl Fn(&T, &T) -> bool) -> Vec<(&'a T, Vec<C>)> {
    let mut clusters: Vec<(&T, Vec<C>)> = Vec::new();
    'outer: for (client, item) in items {
        for (rep, clients) in clusters.iter_mut() {
            if eq(rep, item) {
                clients.push(client.clone());
                continue 'outer;
            }
        }
        clusters.push((item, vec![client.clone()]));
    }
    clusters
}

/// Clusters by strict `Result` equality (ch. 3).
pub fn cluster<C: Clone>(items: &[(C, Result)]) -> Vec<(&Result, Vec<C>)> {
    cluster_with(items, |a: &Result, b| a.strict_eq(b))
}

/// Clusters by filter-aware equality. Takes `&FilteredResult` rather than
/// an owned one since `FilteredResult` wraps a closure and isn't `Clone`.
pub fn cluster_filtered<'a, 'f, C: Clone>(items: &'a [(C, &'a FilteredResult<'f>)]) -> Vec<(&'a FilteredResult<'f>, Vec<C>)> {
    let mut clusters: Vec<(&FilteredResult, Vec<C>)> = Vec::new();
    'outer: for (client, item) in items {
        for (rep, clients) in clusters.iter_mut() {
            if rep.eq(&item.result) {
                clients.push(client.clone());
                continue 'outer;
            }
        }
        clusters.push((*item, vec![client.clone()]));
    }
    clusters
}

/// Removes a lone SIGILL cluster before logging: one client disagreeing
/// by being the only one to hit an unknown/undocumented encoding isn't
/// an architectural diff worth a reproducer (ch. 4.7). Does nothing if
/// zero or more than one cluster signaled SIGILL.
///
/// Takes a borrowed slice rather than consuming it: callers (ch. 4.7's
/// minimal-diff tree search) decide whether a step is worth logging or
/// continuing based on this function's result, but still need the
/// original, un-pruned clustering afterward.
pub fn remove_unusable<'a, C: Clone, T: HasSignum>(clusters: &'a [(&'a T, Vec<C>)]) -> Vec<(&'a T, Vec<C>)> {
    let sigill_count = clusters.iter().filter(|(r, _)| r.signum() == SIGILL).count();
    clusters
        .iter()
        .filter(|(r, _)| !(sigill_count == 1 && r.signum() == SIGILL))
        .map(|(r, c)| (*r, c.clone()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn result(signum: u8) -> Result {
        Result { signum, cycle_diff: None, instret_diff: None, regs: BTreeMap::new(), si_addr: 0, si_pc: 0, si_code: 0, mem_diffs: None }
    }

    #[test]
    fn cluster_groups_equal_results_preserving_first_seen_order() {
        let items = vec![(1, result(0)), (2, result(11)), (3, result(0))];
        let clusters = cluster(&items);
        assert_eq!(clusters.len(), 2);
        assert_eq!(clusters[0].1, vec![1, 3]);
        assert_eq!(clusters[1].1, vec![2]);
    }

    #[test]
    fn remove_unusable_drops_lone_sigill_cluster() {
        let items = vec![(1, result(0)), (2, result(SIGILL)), (3, result(0))];
        let clusters = cluster(&items);
        let cleaned = remove_unusable(&clusters);
        assert_eq!(cleaned.len(), 1);
        assert_eq!(cleaned[0].0.signum, 0);
    }

    #[test]
    fn remove_unusable_keeps_clusters_when_multiple_sigill_groups_disagree() {
        let items = vec![(1, result(SIGILL)), (2, result(SIGILL))];
        let clusters = cluster(&items);
        let cleaned = remove_unusable(&clusters);
        assert_eq!(cleaned.len(), 1);
    }

    #[test]
    fn remove_unusable_leaves_original_clustering_untouched() {
        let items = vec![(1, result(0)), (2, result(SIGILL)), (3, result(0))];
        let clusters = cluster(&items);
        let _ = remove_unusable(&clusters);
        assert_eq!(clusters.len(), 2);
    }
}
