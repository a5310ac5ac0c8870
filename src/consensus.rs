// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! Agreement on the successor of one configuration.
//!
//! A [`ConsensusDriver`] is handed a chain index `slot` and a proposal, and
//! talks to the quorum of the blueprint at that index until it knows the one
//! value that follows it. Two drivers are provided:
//!
//!   - [`PaxosDriver`] runs single-decree Paxos with the replicas as
//!     acceptors and the client as proposer.
//!
//!   - [`SpSnDriver`] runs the speculative-snapshot protocol: rounds of
//!     collect-then-commit that merge every proposal they meet, so concurrent
//!     proposers converge on their join instead of competing for rounds.
//!
//! Either driver may discover that a newer configuration has been fixed in
//! the meantime, in which case it returns [`Hop::Restart`] and the caller
//! resumes its traversal from the session's updated position.
//!
//! Drivers only ever see a proposal with members: empty proposals are
//! rejected up front, and hops that carry no proposal are plain reads.

use crate::{
    AcceptRequest, Access, Blueprint, LAPropRequest, PrepareRequest, Result, Round,
    SCommitRequest, Session, SpSnOneRequest,
};
use std::thread;
use tracing::debug;

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Hop {
    /// The agreed successor. `recorded` is set when the driver has already
    /// left it in the `Next` of the slot's write quorum, so no `WriteN` is
    /// needed to publish it there.
    Decided { value: Blueprint, recorded: bool },
    /// A newer fixed configuration turned up; traversal must resume from the
    /// session's `cur`.
    Restart,
}

pub trait ConsensusDriver {
    fn decide(&mut self, s: &mut Session<'_>, slot: usize, proposal: &Blueprint) -> Result<Hop>;
}

#[derive(Clone, Copy, Debug, Default)]
pub struct PaxosDriver;

impl ConsensusDriver for PaxosDriver {
    fn decide(&mut self, s: &mut Session<'_>, slot: usize, proposal: &Blueprint) -> Result<Hop> {
        let blp = s.blueprint(slot)?;
        let config_len = blp.len();
        let id = s.caller.id;
        let mut round = Round::initial(id);
        let mut backoff = s.caller.config.backoff_base;
        loop {
            let prepare = PrepareRequest { config_len, round };
            let promise = s.call("prepare", Access::Read, &blp, |q| q.prepare(&prepare))?;
            let promise = promise.reply;
            if s.fold_stale(promise.stale, slot)? {
                return Ok(Hop::Restart);
            }
            if let Some(decided) = promise.decided {
                debug!("client {} found {} already decided at {}", id, decided, blp);
                return Ok(Hop::Decided {
                    value: decided,
                    recorded: false,
                });
            }
            if promise.promised > round {
                round = round.outbid(promise.promised);
                debug!(
                    "client {} outbid at {}, retrying as {} after {:?}",
                    id, blp, round, backoff
                );
                thread::sleep(backoff);
                backoff *= 2;
                continue;
            }

            let value = match promise.accepted {
                Some((_, v)) => v,
                None => proposal.merge(&blp),
            };
            let accept = AcceptRequest {
                config_len,
                round,
                value: value.clone(),
            };
            let learn = s.call("accept", Access::Write, &blp, |q| q.accept(&accept))?;
            let learn = learn.reply;
            if s.fold_stale(learn.stale, slot)? {
                return Ok(Hop::Restart);
            }
            if let Some(decided) = learn.decided {
                return Ok(Hop::Decided {
                    value: decided,
                    recorded: false,
                });
            }
            if !learn.learned {
                round = round.next_rank();
                debug!("client {} not learned at {}, retrying as {}", id, blp, round);
                continue;
            }
            debug!("client {} decided {} after {}", id, value, blp);
            return Ok(Hop::Decided {
                value,
                recorded: false,
            });
        }
    }
}

#[derive(Clone, Copy, Debug, Default)]
pub struct SpSnDriver;

impl ConsensusDriver for SpSnDriver {
    fn decide(&mut self, s: &mut Session<'_>, slot: usize, proposal: &Blueprint) -> Result<Hop> {
        let blp = s.blueprint(slot)?;
        let this_len = blp.len();
        let chain_len = s.blueprint(s.cur)?.len();
        let id = s.caller.id;
        let mut candidate = proposal.merge(&blp);

        let la = LAPropRequest {
            proposal: candidate.clone(),
            config_len: this_len,
        };
        let attempted = s.call("la_prop", Access::Write, &blp, |q| q.la_prop(&la))?;
        let attempted = attempted.reply;
        if let Some(fixed) = attempted.stale {
            debug!("client {} adopting {} as head", id, fixed);
            s.adopt_head(fixed);
            return Ok(Hop::Restart);
        }
        if let Some(other) = attempted.latest_attempted {
            candidate = candidate.merge(&other);
        }
        s.fold_next(&attempted.next)?;

        let mut round: u32 = 0;
        loop {
            let one = SpSnOneRequest {
                chain_len,
                fixed: if slot == s.cur && round == 0 {
                    Some(blp.clone())
                } else {
                    None
                },
                this_len,
                round,
                proposal: candidate.clone(),
            };
            let collect = s.call("spsn_one", Access::Read, &blp, |q| q.spsn_one(&one))?;
            let collect = collect.reply;
            if let Some(fixed) = collect.stale {
                debug!("client {} adopting {} as head", id, fixed);
                s.adopt_head(fixed);
                return Ok(Hop::Restart);
            }
            if round == 0 {
                s.observe(&collect.state);
            }
            let commit = collect.collected.iter().all(|c| *c == candidate);
            if !commit {
                candidate = collect
                    .collected
                    .iter()
                    .fold(candidate, |acc, c| acc.merge(c));
            }
            let sc = SCommitRequest {
                chain_len,
                this_len,
                round,
                commit,
                collected: candidate.clone(),
            };
            let ack = s.call("s_commit", Access::Write, &blp, |q| q.s_commit(&sc))?;
            let ack = ack.reply;
            if let Some(fixed) = ack.stale {
                debug!("client {} adopting {} as head", id, fixed);
                s.adopt_head(fixed);
                return Ok(Hop::Restart);
            }
            let committed = if commit {
                candidate.clone()
            } else {
                ack.committed
            };
            if committed.has_members() {
                s.chain.find_or_insert(&committed)?;
            }
            if ack.further.is_empty() {
                debug!(
                    "client {} settled {} after {} in round {}",
                    id, candidate, blp, round
                );
                return Ok(Hop::Decided {
                    value: candidate,
                    recorded: commit,
                });
            }
            candidate = candidate.merge(&ack.further);
            round += 1;
        }
    }
}
