// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! The client side: walking the configuration chain.
//!
//! Every client operation is one traversal of the client's [`Chain`], from
//! the newest configuration it knows to be fixed to the newest it knows of at
//! all. At each configuration the traversal either agrees on a successor
//! (when it carries a proposal the configuration doesn't already include) or
//! just reads the register value and any successor already recorded there,
//! then writes the successor back so that the configuration's replicas know
//! it too. At the end of the chain the newest register value seen is
//! installed, along with the last configuration, in that configuration's
//! quorum, which makes it fixed.
//!
//! A reply at any point may reveal that some configuration further along has
//! already been fixed. The traversal then folds it into the chain and resumes
//! from there, discarding anything older.

use crate::{
    Access, Blueprint, Caller, Chain, ClientConfig, Comparison, ConsensusDriver, Error,
    GetOneRequest, Hop, PaxosDriver, QuorumStrategy, ReadSRequest, Result, Session,
    SetStateRequest, SpSnDriver, State, WriteNRequest,
};
use std::sync::Arc;
use tracing::{debug, error, trace};

/// What a client operation saw: the newest register value (or the value it
/// wrote) and how many quorum round-trips it took.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Outcome {
    pub state: State,
    pub rpcs: usize,
}

#[derive(Clone, Debug)]
enum Step {
    Traverse(usize),
    RunConsensus(usize),
    Read(usize),
    Write(usize, Option<Blueprint>),
    Converged,
}

pub struct Client<D> {
    caller: Caller,
    chain: Chain,
    driver: D,
}

pub type PaxosClient = Client<PaxosDriver>;
pub type SpSnClient = Client<SpSnDriver>;

impl<D: ConsensusDriver> Client<D> {
    pub fn new(
        config: ClientConfig,
        head: Blueprint,
        strategy: Arc<dyn QuorumStrategy>,
        fallback: Arc<dyn QuorumStrategy>,
        driver: D,
    ) -> Result<Self> {
        config.validate()?;
        if !head.has_members() {
            return Err(Error::Config(
                "initial configuration has no members".into(),
            ));
        }
        Ok(Client {
            caller: Caller::new(config, strategy, fallback),
            chain: Chain::new(head),
            driver,
        })
    }

    pub fn id(&self) -> u32 {
        self.caller.id
    }

    pub fn chain(&self) -> &Chain {
        &self.chain
    }

    /// Moves the system to a configuration that includes `proposal`.
    pub fn reconfigure(&mut self, proposal: &Blueprint) -> Result<Outcome> {
        if !proposal.has_members() {
            error!(
                "client {} refusing to propose empty configuration {}",
                self.caller.id, proposal
            );
            return Err(Error::EmptyProposal);
        }
        if let Some(head) = self.chain.head() {
            if proposal.compare(head).is_subsumed() {
                debug!(
                    "client {} proposal {} already in place",
                    self.caller.id, proposal
                );
                return Ok(Outcome {
                    state: State::default(),
                    rpcs: 0,
                });
            }
        }
        debug!("client {} reconfiguring to {}", self.caller.id, proposal);
        self.run(Some(proposal.clone()), None, false)
    }

    /// Atomic read: the value returned is written back before returning.
    pub fn read(&mut self) -> Result<Outcome> {
        self.run(None, None, true)
    }

    pub fn write(&mut self, value: Vec<u8>) -> Result<Outcome> {
        self.run(None, Some(value), true)
    }

    /// Catches the chain up with whatever configurations are fixed or
    /// decided, without writing anything unless the chain moved.
    pub fn refresh(&mut self) -> Result<Outcome> {
        self.run(None, None, false)
    }

    /// Asks the head configuration for its successor, installing `fallback`
    /// (joined with the head) if none has been proposed there yet.
    pub fn successor(&mut self, fallback: &Blueprint) -> Result<Option<Blueprint>> {
        let mut s = Session::new(&self.caller, &mut self.chain);
        loop {
            let head = s.blueprint(0)?;
            let mut offer = if fallback.has_members() {
                fallback.merge(&head)
            } else {
                Blueprint::default()
            };
            if offer == head {
                offer = Blueprint::default();
            }
            let req = GetOneRequest {
                config_len: head.len(),
                fallback: offer,
            };
            let ans = s.call("get_one", Access::Write, &head, |q| q.get_one(&req))?;
            if s.fold_stale(ans.reply.stale, 0)? {
                let cur = s.cur;
                s.chain.trim(cur);
                s.cur = 0;
                continue;
            }
            if let Some(next) = &ans.reply.next {
                s.chain.find_or_insert(next)?;
            }
            return Ok(ans.reply.next);
        }
    }

    fn run(
        &mut self,
        proposal: Option<Blueprint>,
        mut value: Option<Vec<u8>>,
        writeback: bool,
    ) -> Result<Outcome> {
        let Client {
            caller,
            chain,
            driver,
        } = self;
        let id = caller.id;
        let mut s = Session::new(caller, chain);
        let mut prop = proposal;
        let mut carried = false;
        let mut step = Step::Traverse(0);
        loop {
            trace!("client {} at {:?} (cur {})", id, step, s.cur);
            step = match step {
                Step::Traverse(i) => {
                    let i = i.max(s.cur);
                    if i >= s.chain.len() {
                        Step::Converged
                    } else {
                        let slot = s.blueprint(i)?;
                        match &prop {
                            None => Step::Read(i),
                            Some(p) => match p.compare(&slot) {
                                c if c.is_subsumed() => Step::Read(i),
                                _ if !carried => Step::RunConsensus(i),
                                Comparison::Newer => Step::Write(i, Some(p.clone())),
                                c => {
                                    error!(
                                        "client {} carried proposal {} is {:?} to chain entry {}",
                                        id, p, c, slot
                                    );
                                    return Err(Error::ProtocolInvariant(format!(
                                        "decided proposal {} incomparable with {}",
                                        p, slot
                                    )));
                                }
                            },
                        }
                    }
                }

                Step::RunConsensus(i) => {
                    let p = match &prop {
                        Some(p) => p.clone(),
                        None => {
                            return Err(Error::ProtocolInvariant(
                                "consensus without a proposal".into(),
                            ))
                        }
                    };
                    match driver.decide(&mut s, i, &p)? {
                        Hop::Restart => Step::Traverse(s.cur),
                        Hop::Decided { value, recorded } => {
                            if p.compare(&value).is_subsumed() {
                                carried = true;
                                prop = Some(value.clone());
                            }
                            if recorded {
                                s.chain.find_or_insert(&value)?;
                                Step::Traverse(i + 1)
                            } else {
                                Step::Write(i, Some(value))
                            }
                        }
                    }
                }

                Step::Read(i) => {
                    let blp = s.blueprint(i)?;
                    let req = ReadSRequest {
                        config_len: blp.len(),
                    };
                    let ans = s.call("read_s", Access::Read, &blp, |q| q.read_s(&req))?;
                    if s.fold_stale(ans.reply.stale, i)? {
                        Step::Traverse(s.cur)
                    } else {
                        s.observe(&ans.reply.state);
                        s.fold_next(&ans.reply.next)?;
                        Step::Write(i, s.chain.get(i + 1).cloned())
                    }
                }

                Step::Write(i, None) => Step::Traverse(i + 1),

                Step::Write(i, Some(next)) => {
                    let blp = s.blueprint(i)?;
                    if blp.learned_compare(&next) != Comparison::Older {
                        Step::Traverse(i + 1)
                    } else {
                        let req = WriteNRequest {
                            config_len: blp.len(),
                            proposal: next.clone(),
                        };
                        let ans = s.call("write_n", Access::Write, &blp, |q| q.write_n(&req))?;
                        if s.fold_stale(ans.reply.stale, i)? {
                            Step::Traverse(s.cur)
                        } else {
                            s.observe(&ans.reply.state);
                            s.note_replicas(&ans.from);
                            s.chain.find_or_insert(&next)?;
                            s.fold_next(&ans.reply.next)?;
                            Step::Traverse(i + 1)
                        }
                    }
                }

                Step::Converged => {
                    let last = s.chain.len().saturating_sub(1);
                    if last <= s.cur && !writeback {
                        break;
                    }
                    if let Some(v) = value.take() {
                        let written = s.best.successor(v, id);
                        s.observe(&written);
                    }
                    let blp = s.blueprint(last)?;
                    let req = SetStateRequest {
                        cur: blp.clone(),
                        cur_len: blp.len(),
                        state: s.best.clone(),
                        latest_attempted: None,
                    };
                    let ans = s.call("set_state", Access::Write, &blp, |q| q.set_state(&req))?;
                    if s.fold_stale(ans.reply.stale, last)? {
                        Step::Traverse(s.cur)
                    } else {
                        s.observe(&ans.reply.state);
                        s.cur = last;
                        let known = s.chain.len();
                        s.fold_next(&ans.reply.next)?;
                        if s.chain.len() > known {
                            debug!("client {} found successor of {} while fixing it", id, blp);
                            Step::Traverse(last)
                        } else {
                            debug!("client {} fixed {} with {:?}", id, blp, s.best);
                            break;
                        }
                    }
                }
            };
        }
        let cur = s.cur;
        s.chain.trim(cur);
        Ok(Outcome {
            state: s.best.clone(),
            rpcs: s.rpcs,
        })
    }
}
