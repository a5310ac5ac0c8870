// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{
    Answer, Blueprint, Chain, ClientConfig, Error, Quorum, QuorumStrategy, Result, State,
    TransportError,
};
use std::sync::Arc;
use tracing::{error, warn};

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Access {
    Read,
    Write,
}

/// Makes quorum calls on behalf of one client, with the retry policy every
/// call site shares: the first attempt goes to the preferred strategy, and
/// every later one to the fallback (full) strategy, up to
/// `config.max_attempts` attempts in total.
#[derive(Clone)]
pub struct Caller {
    pub id: u32,
    pub config: ClientConfig,
    strategy: Arc<dyn QuorumStrategy>,
    fallback: Arc<dyn QuorumStrategy>,
}

impl std::fmt::Debug for Caller {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Caller")
            .field("id", &self.id)
            .field("config", &self.config)
            .finish()
    }
}

impl Caller {
    pub fn new(
        config: ClientConfig,
        strategy: Arc<dyn QuorumStrategy>,
        fallback: Arc<dyn QuorumStrategy>,
    ) -> Self {
        Caller {
            id: config.id,
            config,
            strategy,
            fallback,
        }
    }

    pub fn call<T, F>(
        &self,
        op: &'static str,
        access: Access,
        blp: &Blueprint,
        hints: &[u32],
        rpc: F,
    ) -> Result<Answer<T>>
    where
        F: Fn(&dyn Quorum) -> Result<Answer<T>, TransportError>,
    {
        let mut attempts = 0;
        loop {
            let strategy = if attempts == 0 {
                &self.strategy
            } else {
                &self.fallback
            };
            let quorum = match access {
                Access::Read => strategy.read_quorum(blp, hints),
                Access::Write => strategy.write_quorum(blp, hints),
            };
            attempts += 1;
            match rpc(quorum.as_ref()) {
                Ok(answer) => return Ok(answer),
                Err(source) if attempts >= self.config.max_attempts => {
                    error!(
                        "client {} giving up on {} at {} after {} attempt(s): {}",
                        self.id, op, blp, attempts, source
                    );
                    return Err(Error::Transport {
                        op,
                        attempts,
                        source,
                    });
                }
                Err(e) => warn!(
                    "client {} {} at {} failed ({}), retrying with full quorum",
                    self.id, op, blp, e
                ),
            }
        }
    }
}

/// Mutable state of one client operation: the chain being walked, the index
/// of the newest configuration known to be fixed, the newest register value
/// seen so far, and a count of quorum round-trips.
pub struct Session<'a> {
    pub caller: &'a Caller,
    pub chain: &'a mut Chain,
    pub cur: usize,
    pub best: State,
    pub rpcs: usize,
    pub hints: Vec<u32>,
}

impl<'a> Session<'a> {
    pub fn new(caller: &'a Caller, chain: &'a mut Chain) -> Self {
        Session {
            caller,
            chain,
            cur: 0,
            best: State::default(),
            rpcs: 0,
            hints: Vec::new(),
        }
    }

    pub fn blueprint(&self, i: usize) -> Result<Blueprint> {
        self.chain
            .get(i)
            .cloned()
            .ok_or_else(|| Error::ProtocolInvariant(format!("chain has no entry {}", i)))
    }

    /// Counts one round-trip and runs `rpc` through the caller's retry policy.
    pub fn call<T, F>(
        &mut self,
        op: &'static str,
        access: Access,
        blp: &Blueprint,
        rpc: F,
    ) -> Result<Answer<T>>
    where
        F: Fn(&dyn Quorum) -> Result<Answer<T>, TransportError>,
    {
        self.rpcs += 1;
        self.caller.call(op, access, blp, &self.hints, rpc)
    }

    /// Folds a configuration some replica reported as fixed into the chain
    /// and moves `cur` up to it. Returns true if `cur` moved.
    pub fn fold_fixed(&mut self, fixed: Option<Blueprint>) -> Result<bool> {
        match fixed {
            None => Ok(false),
            Some(b) => {
                let i = self.chain.find_or_insert(&b)?;
                if i > self.cur {
                    self.cur = i;
                    Ok(true)
                } else {
                    Ok(false)
                }
            }
        }
    }

    /// Handles the `stale` field of a reply to a call made at chain index
    /// `i`. Returns true if the reply was stale, in which case `cur` has moved
    /// past `i` and the caller must restart from it.
    pub fn fold_stale(&mut self, stale: Option<Blueprint>, i: usize) -> Result<bool> {
        let fixed = match stale {
            None => return Ok(false),
            Some(b) => b,
        };
        self.fold_fixed(Some(fixed.clone()))?;
        if self.cur > i {
            Ok(true)
        } else {
            error!(
                "client {} told {} is fixed, which is not newer than chain entry {}",
                self.caller.id, fixed, i
            );
            Err(Error::ProtocolInvariant(format!(
                "stale reply carried {} at chain index {}",
                fixed, i
            )))
        }
    }

    /// Restarts from a fixed configuration newer than anything in the chain.
    pub fn adopt_head(&mut self, head: Blueprint) {
        self.chain.adopt_head(head);
        self.cur = 0;
    }

    pub fn fold_next(&mut self, next: &[Blueprint]) -> Result<()> {
        for b in next {
            self.chain.find_or_insert(b)?;
        }
        Ok(())
    }

    pub fn observe(&mut self, state: &State) {
        self.best = std::mem::take(&mut self.best).newest(state.clone());
    }

    pub fn note_replicas(&mut self, from: &[u32]) {
        self.hints = from.to_vec();
    }
}
