// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::Comparison;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;

/// The register value: an opaque payload stamped with a timestamp and the id
/// of the client that wrote it. States are totally ordered last-writer-wins:
/// the higher timestamp is newer, and equal timestamps are ordered by writer.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct State {
    pub value: Vec<u8>,
    pub timestamp: u64,
    pub writer: u32,
}

impl State {
    pub fn new(value: Vec<u8>, timestamp: u64, writer: u32) -> Self {
        State {
            value,
            timestamp,
            writer,
        }
    }

    fn stamp(&self) -> (u64, u32) {
        (self.timestamp, self.writer)
    }

    /// Never returns `Incomparable`. Two states with the same stamp compare
    /// `Equal` whatever their payloads.
    pub fn compare(&self, other: &State) -> Comparison {
        match self.stamp().cmp(&other.stamp()) {
            Ordering::Less => Comparison::Older,
            Ordering::Greater => Comparison::Newer,
            Ordering::Equal => Comparison::Equal,
        }
    }

    /// Keeps whichever of the two is newer; on a tie keeps `self`.
    pub fn newest(self, other: State) -> State {
        if other.compare(&self) == Comparison::Newer {
            other
        } else {
            self
        }
    }

    /// The state a write of `value` by `writer` produces on top of this one.
    pub fn successor(&self, value: Vec<u8>, writer: u32) -> State {
        State::new(value, self.timestamp + 1, writer)
    }
}
