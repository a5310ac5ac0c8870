// Copyright 2020 Graydon Hoare <graydon@pobox.com>
// Licensed under the MIT and Apache-2.0 licenses.

use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Knobs for a reconfiguring client. Missing fields take their defaults when
/// deserialized.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Client id. Breaks ties between register writes and Paxos rounds, so it
    /// must be nonzero and unique among clients.
    pub id: u32,
    /// Quorum calls made per operation before giving up, counting the first.
    pub max_attempts: usize,
    /// Initial pause before retrying a Paxos prepare that was outbid.
    pub backoff_base: Duration,
}

impl Default for ClientConfig {
    fn default() -> Self {
        ClientConfig {
            id: 1,
            max_attempts: 2,
            backoff_base: Duration::from_millis(1),
        }
    }
}

impl ClientConfig {
    pub fn new(id: u32) -> Self {
        ClientConfig {
            id,
            ..Default::default()
        }
    }

    pub fn with_backoff(mut self, backoff_base: Duration) -> Self {
        self.backoff_base = backoff_base;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.id == 0 {
            return Err(Error::Config("client id must be nonzero".into()));
        }
        if self.max_attempts == 0 {
            return Err(Error::Config("max_attempts must be at least 1".into()));
        }
        Ok(())
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ReplicaConfig {
    /// Serve requests for configurations older than the fixed one instead of
    /// answering them stale.
    pub relaxed: bool,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_json_fills_defaults() {
        let c: ClientConfig = serde_json::from_str(r#"{"id": 7}"#).unwrap();
        assert_eq!(c.id, 7);
        assert_eq!(c.max_attempts, 2);
        assert!(c.validate().is_ok());

        let r: ReplicaConfig = serde_json::from_str("{}").unwrap();
        assert!(!r.relaxed);
    }

    #[test]
    fn zero_id_and_zero_attempts_are_rejected() {
        assert!(matches!(ClientConfig::new(0).validate(), Err(Error::Config(_))));
        let c = ClientConfig {
            max_attempts: 0,
            ..ClientConfig::new(3)
        };
        assert!(c.validate().is_err());
    }
}
