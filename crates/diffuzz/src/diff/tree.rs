// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Minimal-diff tree search (ch. 4.7).
//!
//! A full instruction sequence that provoked a diff might only need its
//! first few steps to reproduce it. This walks `seq_len` up from 1,
//! re-clustering clients at each step, and records a split wherever the
//! filtered clustering still disagrees — while only continuing to refine
//! classes whose step result was clean (a crash stops the sequence).

use std::collections::HashMap;
use std::hash::Hash;

use crate::diff::cluster::{cluster, cluster_filtered, remove_unusable};
use crate::wire::{FilteredResult, Result};

/// One step at which the filtered clustering still disagreed: the
/// unfiltered clustering at that step (for logging) plus the step length.
pub struct DiffSplit<C> {
    pub result_to_clients: Vec<(Result, Vec<C>)>,
    pub seq_len: u8,
}

/// Descending by cluster size; ties broken by ascending minimum client
/// identifier within the cluster (ch. 4.7) - the source's
/// `sorted(..., reverse=True)` over an insertion-ordered dict leaves
/// equal-size order unspecified.
fn sort_by_size_desc<T, C, K: Ord>(clusters: &mut [(&T, Vec<C>)], client_key: &impl Fn(&C) -> K) {
    clusters.sort_by_key(|(_, clients)| {
        let min_key = clients.iter().map(client_key).min();
        (std::cmp::Reverse(clients.len()), min_key)
    });
}

/// Walks `seq_len` from 1 to `until_seq_len`, returning every step at
/// which clients still disagree after filtering.
///
/// `get_results_for_seq_len(seq_len)` must return a `(client, Result)`
/// pair and a `(client, FilteredResult)` pair for every client in
/// `clients`, for that step length.
pub fn find_minimal_diff_tree<'f, C, K: Ord>(
    until_seq_len: u8,
    clients: Vec<C>,
    client_key: impl Fn(&C) -> K,
    mut get_results_for_seq_len: impl FnMut(u8) -> (Vec<(C, Result)>, Vec<(C, FilteredResult<'f>)>),
) -> Vec<DiffSplit<C>>
where
    C: Clone + Eq + Hash,
{
    let mut current_classes: Vec<Vec<C>> = vec![clients];
    let mut splits = Vec::new();

    for seq_len in 1..=until_seq_len {
        let (results, filtered_results) = get_results_for_seq_len(seq_len);
        let result_by_client: HashMap<C, Result> = results.into_iter().collect();
        let filtered_by_client: HashMap<C, FilteredResult<'f>> = filtered_results.into_iter().collect();

        let mut new_classes: Vec<Vec<C>> = Vec::new();

        for class_clients in &current_classes {
            let items: Vec<(C, Result)> = class_clients
                .iter()
                .map(|c| {
                    let result = result_by_client
                        .get(c)
                        .expect("result missing for a client in the current class")
                        .clone();
                    (c.clone(), result)
                })
                .collect();

            let mut clustered = cluster(&items);
            sort_by_size_desc(&mut clustered, &client_key);

            let usable = remove_unusable(&clustered);

            if usable.len() > 1 {
                let filtered_items: Vec<(C, &FilteredResult<'f>)> = class_clients
                    .iter()
                    .map(|c| {
                        let filtered = filtered_by_client
                            .get(c)
                            .expect("filtered result missing for a client in the current class");
                        (c.clone(), filtered)
                    })
                    .collect();

                let mut filtered_clustered = cluster_filtered(&filtered_items);
                sort_by_size_desc(&mut filtered_clustered, &client_key);
                let filtered_usable = remove_unusable(&filtered_clustered);

                if filtered_usable.len() > 1 {
                    let result_to_clients = clustered
                        .iter()
                        .map(|(result, clients)| ((*result).clone(), clients.clone()))
                        .collect();
                    splits.push(DiffSplit { result_to_clients, seq_len });
                }
            }

            for (result, clients) in &clustered {
                if result.signum == 0 && clients.len() > 1 {
                    new_classes.push(clients.clone());
                }
            }
        }

        current_classes = new_classes;
        if current_classes.is_empty() {
            break;
        }
    }

    splits
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;

    fn result(signum: u8, v: u64) -> Result {
        Result { signum, cycle_diff: None, instret_diff: None, regs: BTreeMap::from([(0u8, crate::wire::RegValue::Scalar(v))]), si_addr: 0, si_pc: 0, si_code: 0, mem_diffs: None }
    }

    fn no_op_filter(_a: &Result, _b: &Result) -> bool {
        false
    }

    #[test]
    fn reports_no_splits_when_every_client_agrees() {
        let clients = vec![1u32, 2, 3];
        let splits = find_minimal_diff_tree(2, clients, |c| *c, |_seq_len| {
            let results = vec![(1, result(0, 1)), (2, result(0, 1)), (3, result(0, 1))];
            let filtered = vec![
                (1, FilteredResult { result: result(0, 1), filter: Box::new(no_op_filter) }),
                (2, FilteredResult { result: result(0, 1), filter: Box::new(no_op_filter) }),
                (3, FilteredResult { result: result(0, 1), filter: Box::new(no_op_filter) }),
            ];
            (results, filtered)
        });
        assert!(splits.is_empty());
    }

    #[test]
    fn reports_a_split_when_a_client_disagrees_and_the_filter_does_not_hide_it() {
        let clients = vec![1u32, 2, 3];
        let splits = find_minimal_diff_tree(1, clients, |c| *c, |_seq_len| {
            let results = vec![(1, result(0, 1)), (2, result(0, 1)), (3, result(0, 2))];
            let filtered = vec![
                (1, FilteredResult { result: result(0, 1), filter: Box::new(no_op_filter) }),
                (2, FilteredResult { result: result(0, 1), filter: Box::new(no_op_filter) }),
                (3, FilteredResult { result: result(0, 2), filter: Box::new(no_op_filter) }),
            ];
            (results, filtered)
        });
        assert_eq!(splits.len(), 1);
        assert_eq!(splits[0].seq_len, 1);
        assert_eq!(splits[0].result_to_clients.len(), 2);
    }

    #[test]
    fn a_filter_that_hides_the_diff_suppresses_the_split() {
        let clients = vec![1u32, 2];
        let always_equal = |_a: &Result, _b: &Result| true;
        let splits = find_minimal_diff_tree(1, clients, |c| *c, |_seq_len| {
            let results = vec![(1, result(0, 1)), (2, result(0, 2))];
            let filtered = vec![
                (1, FilteredResult { result: result(0, 1), filter: Box::new(always_equal) }),
                (2, FilteredResult { result: result(0, 2), filter: Box::new(always_equal) }),
            ];
            (results, filtered)
        });
        assert!(splits.is_empty());
    }

    #[test]
    fn a_crashed_client_does_not_carry_its_class_forward() {
        let clients = vec![1u32, 2, 3];
        let splits = find_minimal_diff_tree(2, clients, |c| *c, |seq_len| {
            if seq_len == 1 {
                let results = vec![(1, result(0, 1)), (2, result(0, 1)), (3, result(11, 1))];
                let filtered = vec![
                    (1, FilteredResult { result: result(0, 1), filter: Box::new(no_op_filter) }),
                    (2, FilteredResult { result: result(0, 1), filter: Box::new(no_op_filter) }),
                    (3, FilteredResult { result: result(11, 1), filter: Box::new(no_op_filter) }),
                ];
                (results, filtered)
            } else {
                let results = vec![(1, result(0, 5)), (2, result(0, 6))];
                let filtered = vec![
                    (1, FilteredResult { result: result(0, 5), filter: Box::new(no_op_filter) }),
                    (2, FilteredResult { result: result(0, 6), filter: Box::new(no_op_filter) }),
                ];
                (results, filtered)
            }
        });
        assert_eq!(splits.len(), 2);
        assert_eq!(splits[1].seq_len, 2);
    }

    #[test]
    fn equal_size_clusters_break_ties_by_ascending_minimum_client_identifier() {
        // Two clusters of equal size (2 clients each). Client identifiers are
        // ("hostA", 1), ("hostA", 2), ("hostB", 0), ("hostB", 3). The cluster
        // containing ("hostA", 1) has the lower minimum identifier and must
        // sort first even though it's built from clients inserted later.
        let clients = vec![3u32, 1, 4, 2];
        let identifier = |c: &u32| match c {
            1 => ("hostA".to_string(), 1u32),
            2 => ("hostA".to_string(), 2),
            3 => ("hostB".to_string(), 0),
            4 => ("hostB".to_string(), 3),
            _ => unreachable!(),
        };
        let splits = find_minimal_diff_tree(1, clients, identifier, |_seq_len| {
            let results = vec![(3, result(0, 9)), (1, result(0, 1)), (4, result(0, 9)), (2, result(0, 1))];
            let filtered = vec![
                (3, FilteredResult { result: result(0, 9), filter: Box::new(no_op_filter) }),
                (1, FilteredResult { result: result(0, 1), filter: Box::new(no_op_filter) }),
                (4, FilteredResult { result: result(0, 9), filter: Box::new(no_op_filter) }),
                (2, FilteredResult { result: result(0, 1), filter: Box::new(no_op_filter) }),
            ];
            (results, filtered)
        });
        assert_eq!(splits.len(), 1);
        let result_to_clients = &splits[0].result_to_clients;
        assert_eq!(result_to_clients.len(), 2);
        // ("hostA", 1)/("hostA", 2) -> clients 1, 2 -> result value 1, comes first.
        assert_eq!(result_to_clients[0].0.regs[&0u8], crate::wire::RegValue::Scalar(1));
        let mut first_group = result_to_clients[0].1.clone();
        first_group.sort_unstable();
        assert_eq!(first_group, vec![1, 2]);
        // ("hostB", 0)/("hostB", 3) -> clients 3, 4 -> result value 9, comes second.
        assert_eq!(result_to_clients[1].0.regs[&0u8], crate::wire::RegValue::Scalar(9));
        let mut second_group = result_to_clients[1].1.clone();
        second_group.sort_unstable();
        assert_eq!(second_group, vec![3, 4]);
    }
}
