// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Request and reply bodies for every replica RPC.
//!
//! Every reply carries a `stale` field. It is set when the caller addressed a
//! configuration older than the replica's fixed one, holds that fixed
//! configuration, and means nothing else in the reply is meaningful.
//!
//! Replies from the members of a quorum are folded into one with
//! [`QuorumReply::combine`], which plays the role of the quorum function.

use crate::{Blueprint, State};
use itertools::Itertools;
use serde::{Deserialize, Serialize};
use std::fmt;

/// A Paxos round. Rounds are compared lexicographically by rank and then by
/// the client that owns them, so rounds of different clients never collide
/// and any client can always construct a round above one it has seen.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Round {
    pub rank: u32,
    pub client: u32,
}

impl Round {
    pub fn initial(client: u32) -> Self {
        Round { rank: 0, client }
    }

    /// The smallest round owned by this round's client that is strictly
    /// greater than `seen`.
    pub fn outbid(self, seen: Round) -> Round {
        let rank = if seen.client < self.client {
            seen.rank
        } else {
            seen.rank + 1
        };
        Round {
            rank,
            client: self.client,
        }
    }

    pub fn next_rank(self) -> Round {
        Round {
            rank: self.rank + 1,
            client: self.client,
        }
    }
}

impl fmt::Display for Round {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "r{}.{}", self.rank, self.client)
    }
}

/// Folding of the replies gathered from one quorum.
pub trait QuorumReply: Sized {
    fn combine(self, other: Self) -> Self;
}

fn newer_stale(a: Option<Blueprint>, b: Option<Blueprint>) -> Option<Blueprint> {
    match (a, b) {
        (Some(a), Some(b)) => Some(if b.len() > a.len() { b } else { a }),
        (a, b) => a.or(b),
    }
}

fn union(a: Vec<Blueprint>, b: Vec<Blueprint>) -> Vec<Blueprint> {
    a.into_iter().chain(b).unique().collect()
}

fn merged(a: Option<Blueprint>, b: Option<Blueprint>) -> Option<Blueprint> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.merge(&b)),
        (a, b) => a.or(b),
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetStateRequest {
    pub cur: Blueprint,
    pub cur_len: u32,
    pub state: State,
    pub latest_attempted: Option<Blueprint>,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SetStateReply {
    pub stale: Option<Blueprint>,
    pub next: Vec<Blueprint>,
    /// The latest-attempted value as it was before this request merged into it.
    pub latest_attempted: Option<Blueprint>,
    pub state: State,
}

impl QuorumReply for SetStateReply {
    fn combine(self, other: Self) -> Self {
        SetStateReply {
            stale: newer_stale(self.stale, other.stale),
            next: union(self.next, other.next),
            latest_attempted: merged(self.latest_attempted, other.latest_attempted),
            state: self.state.newest(other.state),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct WriteNRequest {
    pub config_len: u32,
    pub proposal: Blueprint,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadSRequest {
    pub config_len: u32,
}

/// Reply to both `WriteN` and `ReadS`.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadReply {
    pub stale: Option<Blueprint>,
    pub state: State,
    pub next: Vec<Blueprint>,
}

impl QuorumReply for ReadReply {
    fn combine(self, other: Self) -> Self {
        ReadReply {
            stale: newer_stale(self.stale, other.stale),
            state: self.state.newest(other.state),
            next: union(self.next, other.next),
        }
    }
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareRequest {
    pub config_len: u32,
    pub round: Round,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PrepareReply {
    pub stale: Option<Blueprint>,
    pub decided: Option<Blueprint>,
    /// Highest round this acceptor has promised.
    pub promised: Round,
    /// Highest round this acceptor has accepted a value in, and that value.
    pub accepted: Option<(Round, Blueprint)>,
}

impl QuorumReply for PrepareReply {
    fn combine(self, other: Self) -> Self {
        let accepted = match (self.accepted, other.accepted) {
            (Some(a), Some(b)) => Some(if b.0 > a.0 { b } else { a }),
            (a, b) => a.or(b),
        };
        PrepareReply {
            stale: newer_stale(self.stale, other.stale),
            decided: self.decided.or(other.decided),
            promised: self.promised.max(other.promised),
            accepted,
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptRequest {
    pub config_len: u32,
    pub round: Round,
    pub value: Blueprint,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct AcceptReply {
    pub stale: Option<Blueprint>,
    pub learned: bool,
    pub decided: Option<Blueprint>,
}

impl QuorumReply for AcceptReply {
    fn combine(self, other: Self) -> Self {
        AcceptReply {
            stale: newer_stale(self.stale, other.stale),
            learned: self.learned && other.learned,
            decided: self.decided.or(other.decided),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpSnOneRequest {
    /// Length of the caller's chain head; the staleness watermark.
    pub chain_len: u32,
    /// The caller's chain head, sent once so fresh replicas can adopt it.
    pub fixed: Option<Blueprint>,
    pub this_len: u32,
    pub round: u32,
    pub proposal: Blueprint,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SpSnOneReply {
    pub stale: Option<Blueprint>,
    pub state: State,
    pub collected: Vec<Blueprint>,
}

impl QuorumReply for SpSnOneReply {
    fn combine(self, other: Self) -> Self {
        SpSnOneReply {
            stale: newer_stale(self.stale, other.stale),
            state: self.state.newest(other.state),
            collected: union(self.collected, other.collected),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SCommitRequest {
    pub chain_len: u32,
    pub this_len: u32,
    pub round: u32,
    pub commit: bool,
    pub collected: Blueprint,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SCommitReply {
    pub stale: Option<Blueprint>,
    /// Value committed for the slot so far, empty if none.
    pub committed: Blueprint,
    /// Join of the proposals other clients carried into the next round that
    /// the request's value does not already subsume; empty if none.
    pub further: Blueprint,
}

impl QuorumReply for SCommitReply {
    fn combine(self, other: Self) -> Self {
        SCommitReply {
            stale: newer_stale(self.stale, other.stale),
            committed: self.committed.merge(&other.committed),
            further: self.further.merge(&other.further),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct LAPropRequest {
    pub proposal: Blueprint,
    pub config_len: u32,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct LAPropReply {
    pub stale: Option<Blueprint>,
    /// Present only if it holds more than the request's proposal.
    pub latest_attempted: Option<Blueprint>,
    /// Successors already pending at the addressed slot.
    pub next: Vec<Blueprint>,
}

impl QuorumReply for LAPropReply {
    fn combine(self, other: Self) -> Self {
        LAPropReply {
            stale: newer_stale(self.stale, other.stale),
            latest_attempted: merged(self.latest_attempted, other.latest_attempted),
            next: union(self.next, other.next),
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetOneRequest {
    pub config_len: u32,
    pub fallback: Blueprint,
}

#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GetOneReply {
    pub stale: Option<Blueprint>,
    pub next: Option<Blueprint>,
}

impl QuorumReply for GetOneReply {
    fn combine(self, other: Self) -> Self {
        GetOneReply {
            stale: newer_stale(self.stale, other.stale),
            next: self.next.or(other.next),
        }
    }
}
