// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use thiserror::Error;

/// Failure of a single quorum call.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("quorum not reached: {got} of {need} replicas answered")]
    NoQuorum { got: usize, need: usize },
    #[error("replica {0} is unreachable")]
    Unreachable(u32),
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("cannot propose a configuration with no members")]
    EmptyProposal,
    #[error("{op} failed after {attempts} attempt(s)")]
    Transport {
        op: &'static str,
        attempts: usize,
        #[source]
        source: TransportError,
    },
    #[error("protocol invariant violated: {0}")]
    ProtocolInvariant(String),
    #[error("invalid configuration: {0}")]
    Config(String),
}

pub type Result<T, E = Error> = std::result::Result<T, E>;
