// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

// Exhaustive check of single-slot Paxos over the real replica handlers. Each
// action is one proposer delivering one request to one acceptor and reading
// its reply, so every interleaving of concurrent Prepare and Accept calls is
// explored.

use crate::{AcceptRequest, Blueprint, Node, PrepareRequest, Round, SlotState};
use std::collections::{BTreeMap, BTreeSet};
use stateright::{Checker, Model, Property};

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum Phase {
    Preparing {
        promises: BTreeMap<usize, Option<(Round, Blueprint)>>,
    },
    Accepting {
        value: Blueprint,
        accepts: BTreeSet<usize>,
    },
    Done(Blueprint),
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct Proposer {
    round: Round,
    phase: Phase,
}

impl Proposer {
    fn preparing(round: Round) -> Self {
        Proposer {
            round,
            phase: Phase::Preparing {
                promises: BTreeMap::new(),
            },
        }
    }
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
struct Cluster {
    acceptors: Vec<SlotState>,
    proposers: Vec<Proposer>,
}

#[derive(Clone, Debug, PartialEq, Eq, Hash)]
enum Action {
    Prepare(usize, usize),
    Accept(usize, usize),
}

struct SlotModel {
    acceptors: usize,
    proposals: Vec<Blueprint>,
    max_rank: u32,
}

impl SlotModel {
    fn new(acceptors: usize, proposers: u32, max_rank: u32) -> Self {
        SlotModel {
            acceptors,
            proposals: (1..=proposers)
                .map(|id| Blueprint::new(0, vec![Node::new(id, 0)]))
                .collect(),
            max_rank,
        }
    }

    fn quorum(&self) -> usize {
        self.acceptors / 2 + 1
    }
}

fn decided(c: &Cluster) -> Vec<&Blueprint> {
    c.proposers
        .iter()
        .filter_map(|p| match &p.phase {
            Phase::Done(v) => Some(v),
            _ => None,
        })
        .collect()
}

impl Model for SlotModel {
    type State = Cluster;
    type Action = Action;

    fn init_states(&self) -> Vec<Cluster> {
        vec![Cluster {
            acceptors: vec![SlotState::default(); self.acceptors],
            proposers: (1..=self.proposals.len() as u32)
                .map(|id| Proposer::preparing(Round::initial(id)))
                .collect(),
        }]
    }

    fn actions(&self, c: &Cluster, actions: &mut Vec<Action>) {
        for (p, prop) in c.proposers.iter().enumerate() {
            for a in 0..self.acceptors {
                match &prop.phase {
                    Phase::Preparing { promises } if !promises.contains_key(&a) => {
                        actions.push(Action::Prepare(p, a))
                    }
                    Phase::Accepting { accepts, .. } if !accepts.contains(&a) => {
                        actions.push(Action::Accept(p, a))
                    }
                    _ => (),
                }
            }
        }
    }

    fn next_state(&self, last: &Cluster, action: Action) -> Option<Cluster> {
        let mut c = last.clone();
        match action {
            Action::Prepare(p, a) => {
                let round = c.proposers[p].round;
                let reply = c.acceptors[a].prepare(&PrepareRequest {
                    config_len: 0,
                    round,
                });
                if reply.promised > round {
                    c.proposers[p] = Proposer::preparing(round.outbid(reply.promised));
                    return Some(c);
                }
                let mut promises = match &c.proposers[p].phase {
                    Phase::Preparing { promises } => promises.clone(),
                    _ => return None,
                };
                promises.insert(a, reply.accepted);
                c.proposers[p].phase = if promises.len() >= self.quorum() {
                    let value = promises
                        .values()
                        .flatten()
                        .max_by_key(|(r, _)| *r)
                        .map(|(_, v)| v.clone())
                        .unwrap_or_else(|| self.proposals[p].clone());
                    Phase::Accepting {
                        value,
                        accepts: BTreeSet::new(),
                    }
                } else {
                    Phase::Preparing { promises }
                };
            }
            Action::Accept(p, a) => {
                let round = c.proposers[p].round;
                let (value, mut accepts) = match &c.proposers[p].phase {
                    Phase::Accepting { value, accepts } => (value.clone(), accepts.clone()),
                    _ => return None,
                };
                let reply = c.acceptors[a].accept(&AcceptRequest {
                    config_len: 0,
                    round,
                    value: value.clone(),
                });
                c.proposers[p] = if !reply.learned {
                    Proposer::preparing(round.next_rank())
                } else {
                    accepts.insert(a);
                    Proposer {
                        round,
                        phase: if accepts.len() >= self.quorum() {
                            Phase::Done(value)
                        } else {
                            Phase::Accepting { value, accepts }
                        },
                    }
                };
            }
        }
        Some(c)
    }

    fn within_boundary(&self, c: &Cluster) -> bool {
        c.proposers.iter().all(|p| p.round.rank <= self.max_rank)
    }

    fn properties(&self) -> Vec<Property<Self>> {
        vec![
            Property::always("agreement", |_, c: &Cluster| {
                decided(c).windows(2).all(|w| w[0] == w[1])
            }),
            Property::always("validity", |m: &SlotModel, c: &Cluster| {
                decided(c).iter().all(|v| m.proposals.contains(v))
            }),
            Property::sometimes("decides", |_, c: &Cluster| !decided(c).is_empty()),
        ]
    }
}

#[test]
fn single_proposer_decides() {
    SlotModel::new(3, 1, 1)
        .checker()
        .threads(num_cpus::get())
        .spawn_bfs()
        .join()
        .assert_properties();
}

#[test]
fn two_proposers_agree() {
    SlotModel::new(3, 2, 2)
        .checker()
        .threads(num_cpus::get())
        .spawn_bfs()
        .join()
        .assert_properties();
}
