use serde::{Deserialize, Serialize};
use crate::Username;

/// One player's side of the relationship graph, as persisted.
///
/// Every list keeps insertion order. A friendship appears in both players'
/// `friends`; a request appears in the sender's `sent` and the receiver's
/// `received`.
#[derive(Clone, Debug, Serialize, Deserialize, Default, Eq, PartialEq)]
pub struct Relations {
    pub friends: Vec<Username>,
    pub sent: Vec<Username>,
    pub received: Vec<Username>,
}

impl Relations {
    pub fn is_empty(&self) -> bool {
        self.friends.is_empty() && self.sent.is_empty() && self.received.is_empty()
    }

    /// Every player this record points at, each listed once.
    pub fn peers(&self) -> Vec<Username> {
        let mut peers: Vec<Username> = Vec::new();
        for peer in self.friends.iter().chain(&self.sent).chain(&self.received) {
            if !peers.contains(peer) {
                peers.push(peer.clone());
            }
        }
        peers
    }

    pub fn rename_peer(&mut self, old: &Username, new: &Username) {
        for list in [&mut self.friends, &mut self.sent, &mut self.received] {
            for entry in list.iter_mut().filter(|entry| **entry == *old) {
                *entry = new.clone();
            }
        }
    }

    pub fn forget_peer(&mut self, peer: &Username) {
        self.friends.retain(|f| f != peer);
        self.sent.retain(|f| f != peer);
        self.received.retain(|f| f != peer);
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
pub struct Player {
    pub username: Username,
    #[serde(default)]
    pub tournament_alias: Option<String>,
}

impl Player {
    pub fn new(username: Username) -> Self {
        Self { username, tournament_alias: None }
    }
}
