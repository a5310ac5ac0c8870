// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Quorum selection and the transport seam.
//!
//! The protocol never talks to a replica directly. It asks a
//! [`QuorumStrategy`] for a [`Quorum`] over some blueprint and makes one call
//! on it; the quorum fans the request out to the replicas it chose, and folds
//! their replies with [`QuorumReply::combine`] once enough have answered.
//!
//! Real deployments put their RPC layer behind these traits. The in-process
//! [`LocalNetwork`] here is what the tests and simulations use.

use crate::{
    AcceptReply, AcceptRequest, Blueprint, GetOneReply, GetOneRequest, LAPropReply,
    LAPropRequest, PrepareReply, PrepareRequest, QuorumReply, ReadReply, ReadSRequest, Replica,
    SCommitReply, SCommitRequest, SetStateReply, SetStateRequest, SpSnOneReply, SpSnOneRequest,
    TransportError, WriteNRequest,
};
use itertools::Itertools;
use parking_lot::Mutex;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use tracing::trace;

/// A combined reply and the ids of the replicas that contributed to it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Answer<T> {
    pub reply: T,
    pub from: Vec<u32>,
}

pub type QuorumResult<T> = Result<Answer<T>, TransportError>;

/// A set of replicas that can be called as one.
pub trait Quorum {
    fn set_state(&self, req: &SetStateRequest) -> QuorumResult<SetStateReply>;
    fn write_n(&self, req: &WriteNRequest) -> QuorumResult<ReadReply>;
    fn read_s(&self, req: &ReadSRequest) -> QuorumResult<ReadReply>;
    fn prepare(&self, req: &PrepareRequest) -> QuorumResult<PrepareReply>;
    fn accept(&self, req: &AcceptRequest) -> QuorumResult<AcceptReply>;
    fn spsn_one(&self, req: &SpSnOneRequest) -> QuorumResult<SpSnOneReply>;
    fn s_commit(&self, req: &SCommitRequest) -> QuorumResult<SCommitReply>;
    fn la_prop(&self, req: &LAPropRequest) -> QuorumResult<LAPropReply>;
    fn get_one(&self, req: &GetOneRequest) -> QuorumResult<GetOneReply>;
}

/// Chooses which replicas of a blueprint to contact. `hints` are ids the
/// caller has recently heard from; a strategy may prefer them or ignore them.
pub trait QuorumStrategy: Send + Sync {
    fn read_quorum(&self, blp: &Blueprint, hints: &[u32]) -> Box<dyn Quorum>;
    fn write_quorum(&self, blp: &Blueprint, hints: &[u32]) -> Box<dyn Quorum>;
}

/// Replicas living in this process, addressed by id. Replicas can be marked
/// down, after which calls to them fail as unreachable.
#[derive(Debug, Default)]
pub struct LocalNetwork {
    replicas: BTreeMap<u32, Arc<Replica>>,
    down: Mutex<BTreeSet<u32>>,
}

impl LocalNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, replica: Replica) {
        self.replicas.insert(replica.id(), Arc::new(replica));
    }

    pub fn replica(&self, id: u32) -> Option<Arc<Replica>> {
        self.replicas.get(&id).cloned()
    }

    pub fn fail(&self, id: u32) {
        self.down.lock().insert(id);
    }

    pub fn recover(&self, id: u32) {
        self.down.lock().remove(&id);
    }

    pub fn call<T, F>(&self, id: u32, f: F) -> Result<T, TransportError>
    where
        F: FnOnce(&Replica) -> T,
    {
        if self.down.lock().contains(&id) {
            return Err(TransportError::Unreachable(id));
        }
        match self.replicas.get(&id) {
            Some(r) => Ok(f(r)),
            None => Err(TransportError::Unreachable(id)),
        }
    }
}

/// A fixed subset of a [`LocalNetwork`] that needs `need` answers.
#[derive(Clone, Debug)]
pub struct LocalQuorum {
    network: Arc<LocalNetwork>,
    members: Vec<u32>,
    need: usize,
}

impl LocalQuorum {
    pub fn new(network: Arc<LocalNetwork>, members: Vec<u32>, need: usize) -> Self {
        LocalQuorum {
            network,
            members,
            need: need.max(1),
        }
    }

    pub fn members(&self) -> &[u32] {
        &self.members
    }

    fn fan_out<T, F>(&self, f: F) -> QuorumResult<T>
    where
        T: QuorumReply,
        F: Fn(&Replica) -> T,
    {
        let mut reply: Option<T> = None;
        let mut from = Vec::new();
        for id in &self.members {
            match self.network.call(*id, &f) {
                Ok(r) => {
                    reply = Some(match reply {
                        Some(acc) => acc.combine(r),
                        None => r,
                    });
                    from.push(*id);
                }
                Err(e) => trace!("quorum call skipped: {}", e),
            }
        }
        match reply {
            Some(reply) if from.len() >= self.need => Ok(Answer { reply, from }),
            _ => Err(TransportError::NoQuorum {
                got: from.len(),
                need: self.need,
            }),
        }
    }
}

impl Quorum for LocalQuorum {
    fn set_state(&self, req: &SetStateRequest) -> QuorumResult<SetStateReply> {
        self.fan_out(|r| r.set_state(req))
    }
    fn write_n(&self, req: &WriteNRequest) -> QuorumResult<ReadReply> {
        self.fan_out(|r| r.write_n(req))
    }
    fn read_s(&self, req: &ReadSRequest) -> QuorumResult<ReadReply> {
        self.fan_out(|r| r.read_s(req))
    }
    fn prepare(&self, req: &PrepareRequest) -> QuorumResult<PrepareReply> {
        self.fan_out(|r| r.prepare(req))
    }
    fn accept(&self, req: &AcceptRequest) -> QuorumResult<AcceptReply> {
        self.fan_out(|r| r.accept(req))
    }
    fn spsn_one(&self, req: &SpSnOneRequest) -> QuorumResult<SpSnOneReply> {
        self.fan_out(|r| r.spsn_one(req))
    }
    fn s_commit(&self, req: &SCommitRequest) -> QuorumResult<SCommitReply> {
        self.fan_out(|r| r.s_commit(req))
    }
    fn la_prop(&self, req: &LAPropRequest) -> QuorumResult<LAPropReply> {
        self.fan_out(|r| r.la_prop(req))
    }
    fn get_one(&self, req: &GetOneRequest) -> QuorumResult<GetOneReply> {
        self.fan_out(|r| r.get_one(req))
    }
}

/// Majority quorums over a [`LocalNetwork`].
///
/// The `majority` flavour contacts exactly a majority of the blueprint's
/// members, hinted ids first and then ascending ids. The `full` flavour
/// contacts every member and still needs only a majority to answer.
#[derive(Clone, Debug)]
pub struct LocalStrategy {
    network: Arc<LocalNetwork>,
    full: bool,
}

impl LocalStrategy {
    pub fn majority(network: Arc<LocalNetwork>) -> Self {
        LocalStrategy {
            network,
            full: false,
        }
    }

    pub fn full(network: Arc<LocalNetwork>) -> Self {
        LocalStrategy {
            network,
            full: true,
        }
    }

    pub fn select(&self, blp: &Blueprint, hints: &[u32]) -> LocalQuorum {
        let ids = blp.ids();
        let need = ids.len() / 2 + 1;
        let members = if self.full {
            ids
        } else {
            hints
                .iter()
                .filter(|h| ids.contains(*h))
                .chain(ids.iter())
                .copied()
                .unique()
                .take(need)
                .collect()
        };
        LocalQuorum::new(self.network.clone(), members, need)
    }
}

impl QuorumStrategy for LocalStrategy {
    fn read_quorum(&self, blp: &Blueprint, hints: &[u32]) -> Box<dyn Quorum> {
        Box::new(self.select(blp, hints))
    }
    fn write_quorum(&self, blp: &Blueprint, hints: &[u32]) -> Box<dyn Quorum> {
        Box::new(self.select(blp, hints))
    }
}

/// Forwards to another strategy with the hints dropped. It avoids
/// recontacting replicas only as well as the wrapped strategy does on its own.
#[derive(Clone, Debug)]
pub struct ThriftyStrategy<S> {
    inner: S,
}

impl<S: QuorumStrategy> ThriftyStrategy<S> {
    pub fn new(inner: S) -> Self {
        ThriftyStrategy { inner }
    }
}

impl<S: QuorumStrategy> QuorumStrategy for ThriftyStrategy<S> {
    fn read_quorum(&self, blp: &Blueprint, _hints: &[u32]) -> Box<dyn Quorum> {
        self.inner.read_quorum(blp, &[])
    }
    fn write_quorum(&self, blp: &Blueprint, _hints: &[u32]) -> Box<dyn Quorum> {
        self.inner.write_quorum(blp, &[])
    }
}
