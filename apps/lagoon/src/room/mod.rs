use std::fmt;

use serde::{Deserialize, Serialize};

/// Relay-assigned handle of one connected client instance.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct TransportAddress(String);

impl TransportAddress {
    pub fn new(value: impl Into<String>) -> Self {
        Self(value.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TransportAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for TransportAddress {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Participant {
    pub user_id: String,
    pub username: Option<String>,
    pub address: TransportAddress,
}

impl Participant {
    pub fn new(user_id: impl Into<String>, address: impl Into<TransportAddress>) -> Self {
        Self {
            user_id: user_id.into(),
            username: None,
            address: address.into(),
        }
    }
}

/// Tracks the single remote participant of a two-party room.
///
/// The tracked address is always the most recently observed live handle for
/// the other participant. Every change bumps `generation` so callers holding
/// an older reading can tell it went stale.
#[derive(Debug)]
pub struct MembershipTracker {
    local_user_id: String,
    remote: Option<Participant>,
    generation: u64,
}

impl MembershipTracker {
    pub fn new(local_user_id: impl Into<String>) -> Self {
        Self {
            local_user_id: local_user_id.into(),
            remote: None,
            generation: 0,
        }
    }

    pub fn local_user_id(&self) -> &str {
        &self.local_user_id
    }

    /// Records (or overwrites) the remote participant. Returns `true` when the
    /// tracked address changed.
    pub fn on_joined(&mut self, participant: Participant) -> bool {
        if participant.user_id == self.local_user_id {
            tracing::debug!(
                target = "lagoon::room",
                address = %participant.address,
                "ignoring join event for local user"
            );
            return false;
        }
        let changed = self.current_remote_address() != Some(&participant.address);
        match self.remote.as_ref() {
            Some(previous) if changed => tracing::info!(
                target = "lagoon::room",
                previous = %previous.address,
                current = %participant.address,
                user_id = %participant.user_id,
                "reassigned remote participant"
            ),
            None => tracing::info!(
                target = "lagoon::room",
                current = %participant.address,
                user_id = %participant.user_id,
                "selected remote participant"
            ),
            _ => {}
        }
        self.remote = Some(participant);
        if changed {
            self.generation += 1;
        }
        changed
    }

    /// Clears the remote participant if `participant` is the one being
    /// tracked. Leaves for any other handle are stale and ignored.
    pub fn on_left(&mut self, participant: &Participant) -> bool {
        if self.current_remote_address() != Some(&participant.address) {
            tracing::debug!(
                target = "lagoon::room",
                address = %participant.address,
                "ignoring leave for untracked address"
            );
            return false;
        }
        self.remote = None;
        self.generation += 1;
        tracing::info!(
            target = "lagoon::room",
            address = %participant.address,
            generation = self.generation,
            "cleared remote participant"
        );
        true
    }

    /// An inbound offer proves its sender is live; adopt its handle.
    pub fn observe_signal_source(&mut self, address: &TransportAddress) -> bool {
        if self.current_remote_address() == Some(address) {
            return false;
        }
        let user_id = self
            .remote
            .as_ref()
            .map(|remote| remote.user_id.clone())
            .unwrap_or_default();
        self.remote = Some(Participant {
            user_id,
            username: None,
            address: address.clone(),
        });
        self.generation += 1;
        tracing::info!(
            target = "lagoon::room",
            current = %address,
            generation = self.generation,
            "adopted signal source as remote participant"
        );
        true
    }

    /// Seeds the tracker from the member list returned when joining a room.
    pub fn seed_members(&mut self, members: impl IntoIterator<Item = Participant>) {
        for member in members {
            self.on_joined(member);
        }
    }

    pub fn current_remote_address(&self) -> Option<&TransportAddress> {
        self.remote.as_ref().map(|remote| &remote.address)
    }

    pub fn remote(&self) -> Option<&Participant> {
        self.remote.as_ref()
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }
}
