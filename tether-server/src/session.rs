use std::collections::HashMap;

use tether_common::{FriendStatus, Username};

use crate::registry::ConnectionId;

/// Per-connection state. Only the connection's own task touches it.
#[derive(Debug, Clone)]
pub struct Session {
    connection: ConnectionId,
    identity: Username,
    /// What this session tells friends about itself.
    own_status: FriendStatus,
    statuses: HashMap<Username, FriendStatus>,
}

impl Session {
    pub fn new(connection: ConnectionId, identity: Username) -> Self {
        Self {
            connection,
            identity,
            own_status: FriendStatus::Connected,
            statuses: HashMap::new(),
        }
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    pub fn identity(&self) -> &Username {
        &self.identity
    }

    pub fn own_status(&self) -> FriendStatus {
        self.own_status
    }

    pub fn set_own_status(&mut self, status: FriendStatus) {
        self.own_status = status;
    }

    /// Last write wins.
    pub fn update_status(&mut self, friend: Username, status: FriendStatus) {
        self.statuses.insert(friend, status);
    }

    pub fn status_of(&self, friend: &Username) -> FriendStatus {
        self.statuses.get(friend).copied().unwrap_or_default()
    }

    pub fn forget(&mut self, friend: &Username) {
        self.statuses.remove(friend);
    }

    pub(crate) fn rebind(&mut self, identity: Username) {
        self.identity = identity;
    }
}
