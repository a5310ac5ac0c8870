// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The replica side of the protocol.
//!
//! A [`SlotState`] is everything one replica knows: the configuration it
//! currently serves as fixed (`cur`, with its length `cur_len` acting as the
//! staleness watermark), the register value, and per-slot agreement state
//! keyed by the length of the configuration whose successor is being agreed.
//! It is a plain value with one method per RPC, so it can be driven directly
//! by a model checker. [`Replica`] puts it behind a lock for concurrent use.
//!
//! Every handler starts with the same check: a request addressing a
//! configuration shorter than `cur_len` gets `cur` back in the reply's
//! `stale` field and changes nothing. Relaxed replicas skip that check.

use crate::{
    AcceptReply, AcceptRequest, Blueprint, GetOneReply, GetOneRequest, LAPropReply,
    LAPropRequest, PrepareReply, PrepareRequest, ReadReply, ReadSRequest, ReplicaConfig, Round,
    SCommitReply, SCommitRequest, SetStateReply, SetStateRequest, SpSnOneReply, SpSnOneRequest,
    State, WriteNRequest,
};
use im::OrdMap;
use itertools::Itertools;
use parking_lot::RwLock;
use tracing::{debug, trace};

/// Paxos acceptor state for one slot.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct AcceptorSlot {
    pub promised: Round,
    pub accepted: Option<(Round, Blueprint)>,
}

/// Speculative-snapshot state for one slot: the proposals seen in each round,
/// and the first value anyone committed.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct SpecSlot {
    pub rounds: OrdMap<u32, Vec<Blueprint>>,
    pub committed: Option<Blueprint>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Hash)]
pub struct SlotState {
    pub cur: Blueprint,
    pub cur_len: u32,
    pub state: State,
    pub next: OrdMap<u32, Vec<Blueprint>>,
    pub acceptors: OrdMap<u32, AcceptorSlot>,
    pub speculative: OrdMap<u32, SpecSlot>,
    pub latest_attempted: Option<Blueprint>,
    pub relaxed: bool,
}

fn drop_below<V: Clone>(map: &OrdMap<u32, V>, len: u32) -> OrdMap<u32, V> {
    map.iter()
        .filter(|(k, _)| **k >= len)
        .map(|(k, v)| (*k, v.clone()))
        .collect()
}

fn push_new(list: &mut Vec<Blueprint>, b: &Blueprint) -> bool {
    if list.contains(b) {
        false
    } else {
        list.push(b.clone());
        true
    }
}

impl SlotState {
    pub fn new(config: ReplicaConfig) -> Self {
        SlotState {
            relaxed: config.relaxed,
            ..Default::default()
        }
    }

    pub fn with_cur(config: ReplicaConfig, cur: Blueprint) -> Self {
        SlotState {
            cur_len: cur.len(),
            cur,
            ..SlotState::new(config)
        }
    }

    fn stale(&self, len: u32) -> Option<Blueprint> {
        if !self.relaxed && len < self.cur_len {
            Some(self.cur.clone())
        } else {
            None
        }
    }

    /// Installs a newer fixed configuration and forgets every slot it makes
    /// obsolete.
    fn advance(&mut self, cur: Blueprint, cur_len: u32) {
        debug_assert!(cur_len > self.cur_len);
        self.cur = cur;
        self.cur_len = cur_len;
        self.next = drop_below(&self.next, cur_len);
        self.acceptors = drop_below(&self.acceptors, cur_len);
        self.speculative = drop_below(&self.speculative, cur_len);
    }

    fn next_at(&self, slot: u32) -> Vec<Blueprint> {
        self.next.get(&slot).cloned().unwrap_or_default()
    }

    fn first_next(&self, slot: u32) -> Option<Blueprint> {
        self.next.get(&slot).and_then(|v| v.first().cloned())
    }

    pub fn set_state(&mut self, req: &SetStateRequest) -> SetStateReply {
        if let Some(cur) = self.stale(req.cur_len) {
            return SetStateReply {
                stale: Some(cur),
                ..Default::default()
            };
        }
        self.state = self.state.clone().newest(req.state.clone());
        let previous = self.latest_attempted.clone();
        if let Some(la) = &req.latest_attempted {
            self.latest_attempted = Some(match &previous {
                Some(p) => p.merge(la),
                None => la.clone(),
            });
        }
        if req.cur_len > self.cur_len {
            self.advance(req.cur.clone(), req.cur_len);
        }
        SetStateReply {
            stale: None,
            next: self.next_at(req.cur_len),
            latest_attempted: previous,
            state: self.state.clone(),
        }
    }

    pub fn write_n(&mut self, req: &WriteNRequest) -> ReadReply {
        if let Some(cur) = self.stale(req.config_len) {
            return ReadReply {
                stale: Some(cur),
                ..Default::default()
            };
        }
        let mut next = self.next_at(req.config_len);
        if push_new(&mut next, &req.proposal) {
            self.next.insert(req.config_len, next.clone());
        }
        ReadReply {
            stale: None,
            state: self.state.clone(),
            next,
        }
    }

    pub fn read_s(&self, req: &ReadSRequest) -> ReadReply {
        if let Some(cur) = self.stale(req.config_len) {
            return ReadReply {
                stale: Some(cur),
                ..Default::default()
            };
        }
        ReadReply {
            stale: None,
            state: self.state.clone(),
            next: self.next_at(req.config_len),
        }
    }

    pub fn prepare(&mut self, req: &PrepareRequest) -> PrepareReply {
        if let Some(cur) = self.stale(req.config_len) {
            return PrepareReply {
                stale: Some(cur),
                ..Default::default()
            };
        }
        let slot = req.config_len;
        let mut acc = self.acceptors.get(&slot).cloned().unwrap_or_default();
        if req.round > acc.promised {
            acc.promised = req.round;
            self.acceptors.insert(slot, acc.clone());
        }
        PrepareReply {
            stale: None,
            decided: self.first_next(slot),
            promised: acc.promised,
            accepted: acc.accepted,
        }
    }

    pub fn accept(&mut self, req: &AcceptRequest) -> AcceptReply {
        if let Some(cur) = self.stale(req.config_len) {
            return AcceptReply {
                stale: Some(cur),
                ..Default::default()
            };
        }
        let slot = req.config_len;
        if let Some(decided) = self.first_next(slot) {
            return AcceptReply {
                stale: None,
                learned: false,
                decided: Some(decided),
            };
        }
        let mut acc = self.acceptors.get(&slot).cloned().unwrap_or_default();
        let learned = req.round >= acc.promised;
        if learned {
            acc.promised = req.round;
            acc.accepted = Some((req.round, req.value.clone()));
            self.acceptors.insert(slot, acc);
        }
        AcceptReply {
            stale: None,
            learned,
            decided: None,
        }
    }

    pub fn spsn_one(&mut self, req: &SpSnOneRequest) -> SpSnOneReply {
        if let Some(cur) = self.stale(req.chain_len) {
            return SpSnOneReply {
                stale: Some(cur),
                ..Default::default()
            };
        }
        if let Some(fixed) = &req.fixed {
            if fixed.len() > self.cur_len {
                self.advance(fixed.clone(), fixed.len());
            }
        }
        let mut spec = self.speculative.get(&req.this_len).cloned().unwrap_or_default();
        let mut round = spec.rounds.get(&req.round).cloned().unwrap_or_default();
        if req.proposal.has_members() && push_new(&mut round, &req.proposal) {
            spec.rounds.insert(req.round, round.clone());
            self.speculative.insert(req.this_len, spec);
        }
        let collected = self
            .next_at(req.this_len)
            .into_iter()
            .chain(round)
            .unique()
            .collect();
        SpSnOneReply {
            stale: None,
            state: self.state.clone(),
            collected,
        }
    }

    pub fn s_commit(&mut self, req: &SCommitRequest) -> SCommitReply {
        if let Some(cur) = self.stale(req.chain_len) {
            return SCommitReply {
                stale: Some(cur),
                ..Default::default()
            };
        }
        let slot = req.this_len;
        let later = req.round + 1;
        let mut spec = self.speculative.get(&slot).cloned().unwrap_or_default();
        if req.commit {
            if spec.committed.is_none() {
                spec.committed = Some(req.collected.clone());
            }
            let mut next = self.next_at(slot);
            if push_new(&mut next, &req.collected) {
                self.next.insert(slot, next);
            }
        } else {
            let mut round = spec.rounds.get(&later).cloned().unwrap_or_default();
            push_new(&mut round, &req.collected);
            spec.rounds.insert(later, round);
        }
        let further = spec
            .rounds
            .get(&later)
            .and_then(|vs| {
                vs.iter()
                    .filter(|b| !b.compare(&req.collected).is_subsumed())
                    .cloned()
                    .fold1(|a, b| a.merge(&b))
            })
            .unwrap_or_default();
        let committed = spec.committed.clone().unwrap_or_default();
        self.speculative.insert(slot, spec);
        SCommitReply {
            stale: None,
            committed,
            further,
        }
    }

    pub fn la_prop(&mut self, req: &LAPropRequest) -> LAPropReply {
        if let Some(cur) = self.stale(req.config_len) {
            return LAPropReply {
                stale: Some(cur),
                ..Default::default()
            };
        }
        let merged = match &self.latest_attempted {
            Some(la) => la.merge(&req.proposal),
            None => req.proposal.clone(),
        };
        self.latest_attempted = Some(merged.clone());
        LAPropReply {
            stale: None,
            latest_attempted: if merged != req.proposal {
                Some(merged)
            } else {
                None
            },
            next: self.next_at(req.config_len),
        }
    }

    pub fn get_one(&mut self, req: &GetOneRequest) -> GetOneReply {
        if let Some(cur) = self.stale(req.config_len) {
            return GetOneReply {
                stale: Some(cur),
                ..Default::default()
            };
        }
        let slot = req.config_len;
        let untouched = self.next.get(&slot).map_or(true, |v| v.is_empty())
            && !self.speculative.contains_key(&slot);
        if untouched && req.fallback.has_members() {
            self.next.insert(slot, vec![req.fallback.clone()]);
        }
        GetOneReply {
            stale: None,
            next: self.first_next(slot),
        }
    }
}

/// A replica process: one [`SlotState`] behind a reader-writer lock. Every
/// handler but `read_s` takes the lock exclusively.
#[derive(Debug)]
pub struct Replica {
    id: u32,
    inner: RwLock<SlotState>,
}

impl Replica {
    pub fn new(id: u32, config: ReplicaConfig) -> Self {
        Replica {
            id,
            inner: RwLock::new(SlotState::new(config)),
        }
    }

    pub fn with_cur(id: u32, config: ReplicaConfig, cur: Blueprint) -> Self {
        Replica {
            id,
            inner: RwLock::new(SlotState::with_cur(config, cur)),
        }
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn snapshot(&self) -> SlotState {
        self.inner.read().clone()
    }

    pub fn set_state(&self, req: &SetStateRequest) -> SetStateReply {
        let mut st = self.inner.write();
        let before = st.cur_len;
        let reply = st.set_state(req);
        if st.cur_len != before {
            debug!(
                "replica {} fixed {} (len {} -> {})",
                self.id, st.cur, before, st.cur_len
            );
        }
        trace!("replica {} set_state -> {:?}", self.id, reply);
        reply
    }

    pub fn write_n(&self, req: &WriteNRequest) -> ReadReply {
        let reply = self.inner.write().write_n(req);
        trace!(
            "replica {} write_n {} at {} -> stale={:?}",
            self.id,
            req.proposal,
            req.config_len,
            reply.stale.is_some()
        );
        reply
    }

    pub fn read_s(&self, req: &ReadSRequest) -> ReadReply {
        self.inner.read().read_s(req)
    }

    pub fn prepare(&self, req: &PrepareRequest) -> PrepareReply {
        let reply = self.inner.write().prepare(req);
        trace!(
            "replica {} prepare {} at {} -> promised {}",
            self.id,
            req.round,
            req.config_len,
            reply.promised
        );
        reply
    }

    pub fn accept(&self, req: &AcceptRequest) -> AcceptReply {
        let reply = self.inner.write().accept(req);
        trace!(
            "replica {} accept {} at {} -> learned={}",
            self.id,
            req.round,
            req.config_len,
            reply.learned
        );
        reply
    }

    pub fn spsn_one(&self, req: &SpSnOneRequest) -> SpSnOneReply {
        let reply = self.inner.write().spsn_one(req);
        trace!(
            "replica {} spsn_one round {} at {} -> {} collected",
            self.id,
            req.round,
            req.this_len,
            reply.collected.len()
        );
        reply
    }

    pub fn s_commit(&self, req: &SCommitRequest) -> SCommitReply {
        let reply = self.inner.write().s_commit(req);
        trace!(
            "replica {} s_commit round {} at {} commit={}",
            self.id,
            req.round,
            req.this_len,
            req.commit
        );
        reply
    }

    pub fn la_prop(&self, req: &LAPropRequest) -> LAPropReply {
        let reply = self.inner.write().la_prop(req);
        trace!("replica {} la_prop {}", self.id, req.proposal);
        reply
    }

    pub fn get_one(&self, req: &GetOneRequest) -> GetOneReply {
        let reply = self.inner.write().get_one(req);
        trace!("replica {} get_one at {} -> {:?}", self.id, req.config_len, reply.next);
        reply
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Node;

    fn bp(ids: &[u32]) -> Blueprint {
        Blueprint::new(0, ids.iter().map(|i| Node::new(*i, 0)))
    }

    fn five() -> Blueprint {
        bp(&[1, 2, 3, 4, 5])
    }

    #[test]
    fn stale_write_is_rejected_without_mutation() {
        let mut st = SlotState::with_cur(ReplicaConfig::default(), five());
        assert_eq!(st.cur_len, 5);
        let before = st.clone();
        let reply = st.write_n(&WriteNRequest {
            config_len: 3,
            proposal: bp(&[6]),
        });
        assert_eq!(reply.stale, Some(five()));
        assert!(reply.next.is_empty());
        assert_eq!(st, before);
    }

    #[test]
    fn relaxed_replica_applies_stale_write() {
        let mut st = SlotState::with_cur(ReplicaConfig { relaxed: true }, five());
        let reply = st.write_n(&WriteNRequest {
            config_len: 3,
            proposal: bp(&[6]),
        });
        assert_eq!(reply.stale, None);
        assert_eq!(reply.next, vec![bp(&[6])]);
        assert_eq!(st.next.get(&3), Some(&vec![bp(&[6])]));
    }

    #[test]
    fn relaxed_replica_never_reports_stale() {
        let mut st = SlotState::with_cur(ReplicaConfig { relaxed: true }, five());
        let round = Round::initial(1);
        let promise = st.prepare(&PrepareRequest {
            config_len: 3,
            round,
        });
        assert_eq!(promise.stale, None);
        assert_eq!(promise.promised, round);
        let learn = st.accept(&AcceptRequest {
            config_len: 3,
            round,
            value: bp(&[6]),
        });
        assert_eq!(learn.stale, None);
        assert!(learn.learned);
        let written = State::default().successor(b"v".to_vec(), 1);
        let set = st.set_state(&SetStateRequest {
            cur: bp(&[1, 2, 3]),
            cur_len: 3,
            state: written.clone(),
            latest_attempted: None,
        });
        assert_eq!(set.stale, None);
        assert_eq!(set.state, written);
        // The watermark still only moves forward.
        assert_eq!(st.cur, five());
        assert_eq!(st.cur_len, 5);
    }

    #[test]
    fn write_n_deduplicates() {
        let mut st = SlotState::default();
        let req = WriteNRequest {
            config_len: 0,
            proposal: bp(&[1]),
        };
        st.write_n(&req);
        let reply = st.write_n(&req);
        assert_eq!(reply.next.len(), 1);
    }

    #[test]
    fn set_state_advances_and_clears_old_slots() {
        let b0 = bp(&[1, 2, 3]);
        let b1 = b0.clone().adding(Node::new(4, 0));
        let mut st = SlotState::with_cur(ReplicaConfig::default(), b0.clone());
        st.write_n(&WriteNRequest {
            config_len: b0.len(),
            proposal: b1.clone(),
        });
        st.prepare(&PrepareRequest {
            config_len: b0.len(),
            round: Round::initial(1),
        });
        let reply = st.set_state(&SetStateRequest {
            cur: b1.clone(),
            cur_len: b1.len(),
            state: State::new(b"x".to_vec(), 1, 1),
            latest_attempted: None,
        });
        assert_eq!(reply.stale, None);
        assert_eq!(reply.state.value, b"x".to_vec());
        assert_eq!(st.cur, b1);
        assert!(st.next.is_empty());
        assert!(st.acceptors.is_empty());

        let older = st.set_state(&SetStateRequest {
            cur: b0.clone(),
            cur_len: b0.len(),
            state: State::new(b"old".to_vec(), 9, 1),
            latest_attempted: None,
        });
        assert_eq!(older.stale, Some(b1.clone()));
        assert_eq!(st.cur_len, b1.len());
        assert_eq!(st.state.value, b"x".to_vec());
    }

    #[test]
    fn set_state_keeps_newest_value_and_merges_latest_attempted() {
        let mut st = SlotState::default();
        let cur = bp(&[1]);
        let req = |ts: u64, la: Option<Blueprint>| SetStateRequest {
            cur: cur.clone(),
            cur_len: cur.len(),
            state: State::new(vec![ts as u8], ts, 1),
            latest_attempted: la,
        };
        let r1 = st.set_state(&req(3, Some(bp(&[2]))));
        assert_eq!(r1.latest_attempted, None);
        let r2 = st.set_state(&req(2, Some(bp(&[3]))));
        assert_eq!(r2.latest_attempted, Some(bp(&[2])));
        assert_eq!(r2.state.timestamp, 3);
        assert_eq!(st.latest_attempted, Some(bp(&[2, 3])));
    }

    #[test]
    fn watermark_never_decreases() {
        let mut st = SlotState::default();
        let mut seen = 0;
        for ids in &[vec![1, 2], vec![1], vec![1, 2, 3], vec![4]] {
            let b = bp(ids);
            st.set_state(&SetStateRequest {
                cur: b.clone(),
                cur_len: b.len(),
                state: State::default(),
                latest_attempted: None,
            });
            assert!(st.cur_len >= seen);
            seen = st.cur_len;
        }
        assert_eq!(seen, 3);
    }

    #[test]
    fn lower_round_cannot_be_accepted_after_higher_prepare() {
        let mut st = SlotState::default();
        let low = Round { rank: 0, client: 1 };
        let high = Round { rank: 0, client: 2 };
        st.prepare(&PrepareRequest {
            config_len: 0,
            round: high,
        });
        let r = st.accept(&AcceptRequest {
            config_len: 0,
            round: low,
            value: bp(&[1]),
        });
        assert!(!r.learned);
        let r = st.accept(&AcceptRequest {
            config_len: 0,
            round: high,
            value: bp(&[2]),
        });
        assert!(r.learned);
        let p = st.prepare(&PrepareRequest {
            config_len: 0,
            round: Round { rank: 1, client: 1 },
        });
        assert_eq!(p.accepted, Some((high, bp(&[2]))));
    }

    #[test]
    fn next_entry_is_reported_as_decided() {
        let mut st = SlotState::default();
        st.write_n(&WriteNRequest {
            config_len: 0,
            proposal: bp(&[7]),
        });
        let p = st.prepare(&PrepareRequest {
            config_len: 0,
            round: Round::initial(1),
        });
        assert_eq!(p.decided, Some(bp(&[7])));
        let a = st.accept(&AcceptRequest {
            config_len: 0,
            round: Round::initial(1),
            value: bp(&[8]),
        });
        assert_eq!(a.decided, Some(bp(&[7])));
    }

    #[test]
    fn la_prop_reports_only_new_information() {
        let mut st = SlotState::default();
        let r = st.la_prop(&LAPropRequest {
            proposal: bp(&[1]),
            config_len: 0,
        });
        assert_eq!(r.latest_attempted, None);
        let r = st.la_prop(&LAPropRequest {
            proposal: bp(&[2]),
            config_len: 0,
        });
        assert_eq!(r.latest_attempted, Some(bp(&[1, 2])));
        let r = st.la_prop(&LAPropRequest {
            proposal: bp(&[1, 2]),
            config_len: 0,
        });
        assert_eq!(r.latest_attempted, None);
        assert!(r.next.is_empty());

        st.write_n(&WriteNRequest {
            config_len: 0,
            proposal: bp(&[3]),
        });
        st.write_n(&WriteNRequest {
            config_len: 7,
            proposal: bp(&[4]),
        });
        let r = st.la_prop(&LAPropRequest {
            proposal: bp(&[1, 2]),
            config_len: 0,
        });
        assert_eq!(r.next, vec![bp(&[3])]);
    }

    #[test]
    fn get_one_installs_fallback_only_once() {
        let mut st = SlotState::default();
        let r = st.get_one(&GetOneRequest {
            config_len: 0,
            fallback: bp(&[1]),
        });
        assert_eq!(r.next, Some(bp(&[1])));
        let r = st.get_one(&GetOneRequest {
            config_len: 0,
            fallback: bp(&[2]),
        });
        assert_eq!(r.next, Some(bp(&[1])));

        let r = st.get_one(&GetOneRequest {
            config_len: 1,
            fallback: Blueprint::default(),
        });
        assert_eq!(r.next, None);
    }

    #[test]
    fn spsn_collects_and_commits() {
        let mut st = SlotState::default();
        let one = |st: &mut SlotState, p: Blueprint| {
            st.spsn_one(&SpSnOneRequest {
                chain_len: 0,
                fixed: None,
                this_len: 0,
                round: 0,
                proposal: p,
            })
        };
        one(&mut st, bp(&[1]));
        let r = one(&mut st, bp(&[2]));
        assert_eq!(r.collected, vec![bp(&[1]), bp(&[2])]);

        let c = st.s_commit(&SCommitRequest {
            chain_len: 0,
            this_len: 0,
            round: 0,
            commit: false,
            collected: bp(&[1, 2]),
        });
        assert_eq!(c.committed, Blueprint::default());
        assert_eq!(c.further, Blueprint::default());

        let c = st.s_commit(&SCommitRequest {
            chain_len: 0,
            this_len: 0,
            round: 0,
            commit: false,
            collected: bp(&[1, 3]),
        });
        assert_eq!(c.further, bp(&[1, 2]));

        let c = st.s_commit(&SCommitRequest {
            chain_len: 0,
            this_len: 0,
            round: 1,
            commit: true,
            collected: bp(&[1, 2, 3]),
        });
        assert_eq!(c.committed, bp(&[1, 2, 3]));
        assert_eq!(st.next.get(&0), Some(&vec![bp(&[1, 2, 3])]));
    }

    #[test]
    fn spsn_one_adopts_newer_fixed_head() {
        let head = bp(&[1, 2]);
        let mut st = SlotState::default();
        st.spsn_one(&SpSnOneRequest {
            chain_len: head.len(),
            fixed: Some(head.clone()),
            this_len: head.len(),
            round: 0,
            proposal: Blueprint::default(),
        });
        assert_eq!(st.cur, head);
        assert!(st.speculative.is_empty());
    }
}
