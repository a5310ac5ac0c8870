// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

/*!
 * This crate implements a reconfigurable atomic register: a register
 * replicated over a quorum system whose membership can change while the
 * register stays available, without ever losing agreement on either the
 * current configuration or the latest register value.
 *
 * There are three layers:
 *
 *   - A small _configuration algebra_. Configurations ("blueprints") are
 *     elements of a join semi-lattice: a 2P-SET of added and removed nodes,
 *     plus a generation counter. Two blueprints conflict when they are
 *     incomparable, and any two blueprints can be reconciled by joining
 *     them. Register values ("states") are ordered last-writer-wins.
 *
 *   - A per-replica _state machine_ that holds the fixed configuration the
 *     replica serves, the register value, and per-slot agreement state. Every
 *     RPC first checks whether the caller is addressing an outdated
 *     configuration and, if so, answers with the newer one and nothing else.
 *
 *   - Client-side _reconfiguration_: a client walks its known chain of
 *     configurations, agreeing on each configuration's successor (either by
 *     single-decree Paxos or by a speculative collect/commit protocol),
 *     propagating what it learns forward, and finally fixing the register
 *     value in the newest configuration.
 *
 * The network transport and the choice of which replicas to contact are left
 * to the embedding application, behind the [`Quorum`] and [`QuorumStrategy`]
 * traits. An in-process implementation ([`LocalNetwork`]) is provided for
 * tests and simulations.
 *
 * ## Reference
 *
 * Leander Jehl, Roman Vitenberg, Hein Meling.
 * SmartMerge: A New Approach to Reconfiguration for Atomic Storage.
 * DISC 2015.
 */

mod cfg;
mod chain;
mod client;
mod config;
mod consensus;
mod error;
mod message;
mod quorum;
mod replica;
mod session;
mod state;

pub use cfg::{Blueprint, BlueprintLD, BlueprintLE, Comparison, Node};
pub use chain::Chain;
pub use client::{Client, Outcome, PaxosClient, SpSnClient};
pub use config::{ClientConfig, ReplicaConfig};
pub use consensus::{ConsensusDriver, Hop, PaxosDriver, SpSnDriver};
pub use error::{Error, Result, TransportError};
pub use message::{
    AcceptReply, AcceptRequest, GetOneReply, GetOneRequest, LAPropReply, LAPropRequest,
    PrepareReply, PrepareRequest, QuorumReply, ReadReply, ReadSRequest, Round, SCommitReply,
    SCommitRequest, SetStateReply, SetStateRequest, SpSnOneReply, SpSnOneRequest, WriteNRequest,
};
pub use quorum::{
    Answer, LocalNetwork, LocalQuorum, LocalStrategy, Quorum, QuorumResult, QuorumStrategy,
    ThriftyStrategy,
};
pub use replica::{AcceptorSlot, Replica, SlotState, SpecSlot};
pub use session::{Access, Caller, Session};
pub use state::State;


#[cfg(test)]
mod stateright_tests;
