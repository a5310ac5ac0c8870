// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

//! `Blueprint` is the configuration lattice: the set of replicas that
//! currently make up the quorum system.
//!
//! Abstractly it's a 2P-SET that stores the set of nodes that have been added
//! and the set that have been removed, plus a max-lattice generation counter.
//! The set of "current members" is the adds minus the removes. Because both
//! sets only ever grow, a blueprint's history is traceable from any blueprint
//! above it in the lattice, and merging two blueprints is just the lattice
//! join.

use im::OrdSet as ArcOrdSet;
use pergola::{ArcOrdSetWithUnion, LatticeElt, MaxDef, Tuple2};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of one replica within a blueprint: the replica id (used to route
/// RPCs) plus a group tag.
#[derive(
    Clone, Copy, Debug, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
pub struct Node {
    pub id: u32,
    pub tag: u32,
}

impl Node {
    pub fn new(id: u32, tag: u32) -> Self {
        Node { id, tag }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "n{}/{}", self.id, self.tag)
    }
}

pub type MembershipLD = Tuple2<ArcOrdSetWithUnion<Node>, ArcOrdSetWithUnion<Node>>;
pub type BlueprintLD = Tuple2<MembershipLD, MaxDef<u32>>;
pub type BlueprintLE = LatticeElt<BlueprintLD>;

/// Four-way result of comparing two partially (or totally) ordered values.
/// Always read as "`self` is ... than `other`".
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Comparison {
    Older,
    Newer,
    Equal,
    Incomparable,
}

impl Comparison {
    /// The comparison seen from the other operand.
    pub fn reverse(self) -> Comparison {
        match self {
            Comparison::Older => Comparison::Newer,
            Comparison::Newer => Comparison::Older,
            c => c,
        }
    }

    /// True for `Older` and `Equal`: `self` is subsumed by `other`.
    pub fn is_subsumed(self) -> bool {
        matches!(self, Comparison::Older | Comparison::Equal)
    }
}

/// A configuration. Wraps the lattice element so the rest of the crate never
/// reaches into tuple fields directly.
#[derive(Clone, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(from = "WireBlueprint", into = "WireBlueprint")]
pub struct Blueprint {
    elt: BlueprintLE,
}

impl Blueprint {
    /// A blueprint at `generation` whose members are exactly `members`.
    pub fn new<I: IntoIterator<Item = Node>>(generation: u32, members: I) -> Self {
        let added: ArcOrdSet<Node> = members.into_iter().collect();
        let membership = LatticeElt::new_from((
            LatticeElt::new_from(added),
            LatticeElt::new_from(ArcOrdSet::new()),
        ));
        Blueprint {
            elt: BlueprintLE::new_from((membership, LatticeElt::new_from(generation))),
        }
    }

    // Each level of a pergola tuple is itself a `LatticeElt`.
    fn added_mut(&mut self) -> &mut ArcOrdSet<Node> {
        &mut self.elt.value.0.value.0.value
    }

    fn removed_mut(&mut self) -> &mut ArcOrdSet<Node> {
        &mut self.elt.value.0.value.1.value
    }

    pub fn adding(mut self, node: Node) -> Self {
        self.added_mut().insert(node);
        self
    }

    /// Removal is permanent: once a node is in the removed set no join can
    /// bring it back.
    pub fn removing(mut self, node: Node) -> Self {
        self.added_mut().insert(node);
        self.removed_mut().insert(node);
        self
    }

    pub fn at_generation(mut self, generation: u32) -> Self {
        let current = &mut self.elt.value.1.value;
        if generation > *current {
            *current = generation;
        }
        self
    }

    pub fn added(&self) -> &ArcOrdSet<Node> {
        &self.elt.value.0.value.0.value
    }

    pub fn removed(&self) -> &ArcOrdSet<Node> {
        &self.elt.value.0.value.1.value
    }

    pub fn generation(&self) -> u32 {
        self.elt.value.1.value
    }

    pub fn members(&self) -> ArcOrdSet<Node> {
        self.added().clone().difference(self.removed().clone())
    }

    pub fn has_members(&self) -> bool {
        self.added().iter().any(|n| !self.removed().contains(n))
    }

    /// Replica ids of the current members, ascending.
    pub fn ids(&self) -> Vec<u32> {
        let mut ids: Vec<u32> = self.members().iter().map(|n| n.id).collect();
        ids.dedup();
        ids
    }

    /// Position of this blueprint in the configuration sequence. Strictly
    /// increases along the lattice order, so it doubles as the staleness
    /// watermark replicas keep for their fixed configuration.
    pub fn len(&self) -> u32 {
        (self.added().len() + self.removed().len()) as u32 + self.generation()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Lattice join: the least blueprint that is newer than or equal to both.
    pub fn merge(&self, other: &Blueprint) -> Blueprint {
        Blueprint {
            elt: &self.elt + &other.elt,
        }
    }

    pub fn compare(&self, other: &Blueprint) -> Comparison {
        let join = &self.elt + &other.elt;
        match (join == self.elt, join == other.elt) {
            (true, true) => Comparison::Equal,
            (true, false) => Comparison::Newer,
            (false, true) => Comparison::Older,
            (false, false) => Comparison::Incomparable,
        }
    }

    /// Compares by length alone. Only meaningful where the two blueprints are
    /// known to be comparable, such as a slot and a value decided for it:
    /// `Older` means `candidate` carries information this slot has not yet
    /// recorded.
    pub fn learned_compare(&self, candidate: &Blueprint) -> Comparison {
        match self.len().cmp(&candidate.len()) {
            std::cmp::Ordering::Less => Comparison::Older,
            std::cmp::Ordering::Greater => Comparison::Newer,
            std::cmp::Ordering::Equal => Comparison::Equal,
        }
    }
}

impl fmt::Display for Blueprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[")?;
        for (i, n) in self.members().iter().enumerate() {
            if i > 0 {
                write!(f, " ")?;
            }
            write!(f, "{}", n)?;
        }
        write!(f, "]@{}", self.len())
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
struct WireBlueprint {
    add: Vec<Node>,
    #[serde(default)]
    rem: Vec<Node>,
    #[serde(default)]
    generation: u32,
}

impl From<WireBlueprint> for Blueprint {
    fn from(w: WireBlueprint) -> Self {
        let mut b = Blueprint::new(w.generation, w.add);
        for n in w.rem {
            b = b.removing(n);
        }
        b
    }
}

impl From<Blueprint> for WireBlueprint {
    fn from(b: Blueprint) -> Self {
        WireBlueprint {
            add: b.added().iter().cloned().collect(),
            rem: b.removed().iter().cloned().collect(),
            generation: b.generation(),
        }
    }
}
