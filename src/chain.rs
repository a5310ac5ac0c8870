// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{Blueprint, Comparison, Error, Result};
use im::Vector;
use tracing::error;

/// A client's view of the configuration sequence: the newest configuration
/// it knows to be fixed at the head, followed by configurations it has
/// learned were decided after it. Each element is strictly newer than the one
/// before it.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chain {
    blueprints: Vector<Blueprint>,
}

impl Chain {
    pub fn new(head: Blueprint) -> Self {
        Chain {
            blueprints: Vector::unit(head),
        }
    }

    pub fn head(&self) -> Option<&Blueprint> {
        self.blueprints.front()
    }

    pub fn last(&self) -> Option<&Blueprint> {
        self.blueprints.back()
    }

    pub fn get(&self, i: usize) -> Option<&Blueprint> {
        self.blueprints.get(i)
    }

    pub fn len(&self) -> usize {
        self.blueprints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.blueprints.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &Blueprint> {
        self.blueprints.iter()
    }

    /// Places `blp` at its sorted position and returns its index. A blueprint
    /// the head already supersedes is not inserted and maps to index 0.
    pub fn find_or_insert(&mut self, blp: &Blueprint) -> Result<usize> {
        if let Some(head) = self.head() {
            if head.compare(blp) == Comparison::Newer {
                return Ok(0);
            }
        }
        let pos = self
            .blueprints
            .iter()
            .position(|b| b.len() >= blp.len())
            .unwrap_or_else(|| self.blueprints.len());
        if let Some(at) = self.blueprints.get(pos) {
            if at.compare(blp) == Comparison::Equal {
                return Ok(pos);
            }
            if at.compare(blp) != Comparison::Newer {
                return Err(self.out_of_order(blp, at));
            }
        }
        if pos > 0 {
            let before = &self.blueprints[pos - 1];
            if before.compare(blp) != Comparison::Older {
                return Err(self.out_of_order(blp, before));
            }
        }
        self.blueprints.insert(pos, blp.clone());
        Ok(pos)
    }

    fn out_of_order(&self, blp: &Blueprint, existing: &Blueprint) -> Error {
        error!(
            "blueprint {} does not fit in chain next to {} ({:?})",
            blp,
            existing,
            existing.compare(blp)
        );
        Error::ProtocolInvariant(format!(
            "blueprint {} is incomparable with chain entry {}",
            blp, existing
        ))
    }

    /// Replaces the whole chain with a single newer head.
    pub fn adopt_head(&mut self, head: Blueprint) {
        self.blueprints = Vector::unit(head);
    }

    /// Drops every entry before index `cur`, which becomes the head.
    pub fn trim(&mut self, cur: usize) {
        if cur > 0 && cur < self.blueprints.len() {
            self.blueprints = self.blueprints.split_off(cur);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::Node;

    fn n(id: u32) -> Node {
        Node::new(id, 0)
    }

    fn base() -> Blueprint {
        Blueprint::new(0, vec![n(1), n(2), n(3)])
    }

    #[test]
    fn inserts_in_order_and_finds_existing() {
        let b0 = base();
        let b1 = b0.clone().adding(n(4));
        let b2 = b1.clone().adding(n(5));
        let mut c = Chain::new(b0.clone());
        assert_eq!(c.find_or_insert(&b2).unwrap(), 1);
        assert_eq!(c.find_or_insert(&b1).unwrap(), 1);
        assert_eq!(c.find_or_insert(&b2).unwrap(), 2);
        assert_eq!(c.find_or_insert(&b0).unwrap(), 0);
        assert_eq!(c.len(), 3);
        assert_eq!(c.last(), Some(&b2));
    }

    #[test]
    fn superseded_blueprint_maps_to_head() {
        let b0 = base();
        let mut c = Chain::new(b0.clone().adding(n(4)));
        assert_eq!(c.find_or_insert(&b0).unwrap(), 0);
        assert_eq!(c.len(), 1);
    }

    #[test]
    fn incomparable_entry_is_an_invariant_violation() {
        let b0 = base();
        let mut c = Chain::new(b0.clone());
        c.find_or_insert(&b0.clone().adding(n(4))).unwrap();
        let r = c.find_or_insert(&b0.adding(n(5)));
        assert!(matches!(r, Err(Error::ProtocolInvariant(_))));
        assert_eq!(c.len(), 2);
    }

    #[test]
    fn trim_and_adopt() {
        let b0 = base();
        let b1 = b0.clone().adding(n(4));
        let b2 = b1.clone().adding(n(5));
        let mut c = Chain::new(b0);
        c.find_or_insert(&b1).unwrap();
        c.find_or_insert(&b2).unwrap();
        c.trim(1);
        assert_eq!(c.head(), Some(&b1));
        assert_eq!(c.len(), 2);
        c.adopt_head(b2.clone());
        assert_eq!(c.iter().cloned().collect::<Vec<_>>(), vec![b2]);
    }
}
