//! Network identity handed to a game server: a container name and a host port.

use serde::{Deserialize, Serialize};
use std::fmt;

/// A (name, port) pair drawn from the identity pool
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Identity {
    /// Container name, unique among live records and open allocations.
    pub name: String,

    /// Host port bound to the game server's listener.
    pub port: u16,
}

impl Identity {
    pub fn new(name: impl Into<String>, port: u16) -> Self {
        Self {
            name: name.into(),
            port,
        }
    }
}

impl fmt::Display for Identity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.name, self.port)
    }
}
