use std::collections::HashMap;
use std::fmt;

use parking_lot::RwLock;
use tether_common::{FriendStatus, Username};
use tokio::sync::mpsc::{self, error::TrySendError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};
use uuid::Uuid;

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "conn_{}", self.0.simple())
    }
}

/// Event pushed from one session to another.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Notification {
    /// `reset` names a peer whose status falls back to disconnected.
    UpdateRelationship { reset: Option<Username> },
    FriendStatus { friend: Username, status: FriendStatus },
    /// Record the asker's status and answer to `reply_to` only.
    Probe {
        asker: Username,
        status: FriendStatus,
        reply_to: ConnectionId,
    },
    Renamed { from: Username, to: Username },
}

#[derive(Clone, Debug)]
pub struct SessionHandle {
    connection: ConnectionId,
    tx: mpsc::Sender<Notification>,
    cancel: CancellationToken,
    status: FriendStatus,
}

impl SessionHandle {
    pub fn new(connection: ConnectionId, tx: mpsc::Sender<Notification>, cancel: CancellationToken) -> Self {
        Self {
            connection,
            tx,
            cancel,
            status: FriendStatus::Connected,
        }
    }

    pub fn connection(&self) -> ConnectionId {
        self.connection
    }

    fn deliver(&self, identity: &Username, notification: Notification) -> bool {
        match self.tx.try_send(notification) {
            Ok(()) => true,
            Err(TrySendError::Full(_)) => {
                warn!(%identity, connection = %self.connection, "notification queue full, dropping session");
                false
            }
            Err(TrySendError::Closed(_)) => {
                debug!(%identity, connection = %self.connection, "session already gone");
                false
            }
        }
    }
}

pub type Outbox = Vec<(Username, Notification)>;

#[derive(Default)]
struct Groups {
    sessions: HashMap<Username, Vec<SessionHandle>>,
    /// Every connection not yet unregistered, including ones dropped for a
    /// transport fault or evicted.
    owners: HashMap<ConnectionId, Username>,
}

impl Groups {
    fn attached(&self, identity: &Username, connection: ConnectionId) -> bool {
        self.sessions
            .get(identity)
            .map_or(false, |group| group.iter().any(|h| h.connection == connection))
    }

    fn resolve(&self, outbox: Outbox) -> Vec<(Username, SessionHandle, Notification)> {
        let mut targets = Vec::new();
        for (identity, notification) in outbox {
            for handle in self.sessions.get(&identity).into_iter().flatten() {
                targets.push((identity.clone(), handle.clone(), notification.clone()));
            }
        }
        targets
    }
}

#[derive(Default)]
pub struct PresenceRegistry {
    groups: RwLock<Groups>,
}

impl PresenceRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, identity: &Username, handle: SessionHandle) {
        let mut groups = self.groups.write();
        groups.owners.insert(handle.connection, identity.clone());
        let group = groups.sessions.entry(identity.clone()).or_default();
        group.retain(|h| h.connection != handle.connection);
        group.push(handle);
    }

    /// Forgets `connection` whatever name it is registered under now. Returns
    /// that name the first time only.
    pub fn unregister(&self, connection: ConnectionId) -> Option<Username> {
        let mut groups = self.groups.write();
        let identity = groups.owners.remove(&connection)?;
        if let Some(group) = groups.sessions.get_mut(&identity) {
            group.retain(|h| h.connection != connection);
            if group.is_empty() {
                groups.sessions.remove(&identity);
            }
        }
        Some(identity)
    }

    pub fn identity_of(&self, connection: ConnectionId) -> Option<Username> {
        let groups = self.groups.read();
        let identity = groups.owners.get(&connection)?;
        groups.attached(identity, connection).then(|| identity.clone())
    }

    /// Runs `commit` and, if it succeeds, moves every session of `old` under
    /// `new`, all under the write lock. Lookups see either the old store and
    /// old layout or both new. The returned outbox is delivered afterwards.
    pub fn rebind<E>(
        &self,
        old: &Username,
        new: &Username,
        commit: impl FnOnce() -> Result<Outbox, E>,
    ) -> Result<usize, E> {
        let mut groups = self.groups.write();
        let outbox = commit()?;
        let moved = groups.sessions.remove(old).unwrap_or_default();
        let count = moved.len();
        if count > 0 {
            groups.sessions.entry(new.clone()).or_default().extend(moved);
        }
        for owner in groups.owners.values_mut().filter(|owner| **owner == *old) {
            *owner = new.clone();
        }
        let targets = groups.resolve(outbox);
        drop(groups);
        self.deliver_all(targets);
        Ok(count)
    }

    /// Runs `commit`, then removes and cancels every session of `identity`
    /// under the same write lock. Returns how many sessions were evicted.
    pub fn evict<E>(&self, identity: &Username, commit: impl FnOnce() -> Result<Outbox, E>) -> Result<usize, E> {
        let mut groups = self.groups.write();
        let outbox = commit()?;
        let evicted = groups.sessions.remove(identity).unwrap_or_default();
        let targets = groups.resolve(outbox);
        drop(groups);
        for handle in &evicted {
            handle.cancel.cancel();
        }
        self.deliver_all(targets);
        Ok(evicted.len())
    }

    /// Delivers an outbox computed while holding the read lock, so the names
    /// in it cannot be rebound between lookup and delivery.
    pub fn notify_resolved<E>(&self, resolve: impl FnOnce() -> Result<Outbox, E>) -> Result<usize, E> {
        let groups = self.groups.read();
        let targets = groups.resolve(resolve()?);
        drop(groups);
        Ok(self.deliver_all(targets))
    }

    pub fn sessions_of(&self, identity: &Username) -> Vec<ConnectionId> {
        self.groups
            .read()
            .sessions
            .get(identity)
            .map(|group| group.iter().map(SessionHandle::connection).collect())
            .unwrap_or_default()
    }

    pub fn is_online(&self, identity: &Username) -> bool {
        self.groups.read().sessions.contains_key(identity)
    }

    pub fn connection_count(&self) -> usize {
        self.groups.read().sessions.values().map(Vec::len).sum()
    }

    pub fn set_status(&self, connection: ConnectionId, status: FriendStatus) {
        let mut groups = self.groups.write();
        let Some(identity) = groups.owners.get(&connection).cloned() else {
            return;
        };
        if let Some(handle) = groups
            .sessions
            .get_mut(&identity)
            .and_then(|group| group.iter_mut().find(|h| h.connection == connection))
        {
            handle.status = status;
        }
    }

    pub fn status_of(&self, identity: &Username) -> FriendStatus {
        self.groups
            .read()
            .sessions
            .get(identity)
            .and_then(|group| group.iter().map(|h| h.status).max())
            .unwrap_or(FriendStatus::Disconnected)
    }

    pub fn notify(&self, identity: &Username, notification: Notification) -> usize {
        self.fan_out(identity, None, notification)
    }

    pub fn notify_except(&self, identity: &Username, skip: ConnectionId, notification: Notification) -> usize {
        self.fan_out(identity, Some(skip), notification)
    }

    pub fn send_to(&self, identity: &Username, connection: ConnectionId, notification: Notification) -> bool {
        let handle = self
            .groups
            .read()
            .sessions
            .get(identity)
            .and_then(|group| group.iter().find(|h| h.connection == connection).cloned());
        match handle {
            Some(handle) => self.deliver_all(vec![(identity.clone(), handle, notification)]) == 1,
            None => false,
        }
    }

    fn fan_out(&self, identity: &Username, skip: Option<ConnectionId>, notification: Notification) -> usize {
        let targets: Vec<_> = self
            .groups
            .read()
            .sessions
            .get(identity)
            .into_iter()
            .flatten()
            .filter(|h| Some(h.connection) != skip)
            .map(|h| (identity.clone(), h.clone(), notification.clone()))
            .collect();
        self.deliver_all(targets)
    }

    fn deliver_all(&self, targets: Vec<(Username, SessionHandle, Notification)>) -> usize {
        let mut delivered = 0;
        let mut failed = Vec::new();
        for (identity, handle, notification) in targets {
            if handle.deliver(&identity, notification) {
                delivered += 1;
            } else {
                failed.push(handle);
            }
        }
        if !failed.is_empty() {
            self.drop_sessions(&failed);
        }
        delivered
    }

    /// A session that cannot take notifications is treated as disconnected.
    /// Its owner entry stays until the session itself unregisters.
    fn drop_sessions(&self, failed: &[SessionHandle]) {
        let mut groups = self.groups.write();
        for group in groups.sessions.values_mut() {
            group.retain(|h| !failed.iter().any(|f| f.connection == h.connection));
        }
        groups.sessions.retain(|_, group| !group.is_empty());
        for handle in failed {
            handle.cancel.cancel();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::convert::Infallible;

    fn name(s: &str) -> Username {
        Username::parse(s).unwrap()
    }

    fn handle_with_capacity(capacity: usize) -> (SessionHandle, mpsc::Receiver<Notification>, CancellationToken) {
        let (tx, rx) = mpsc::channel(capacity);
        let cancel = CancellationToken::new();
        (SessionHandle::new(ConnectionId::new(), tx, cancel.clone()), rx, cancel)
    }

    fn handle() -> (SessionHandle, mpsc::Receiver<Notification>) {
        let (handle, rx, _) = handle_with_capacity(8);
        (handle, rx)
    }

    fn ping() -> Notification {
        Notification::UpdateRelationship { reset: None }
    }

    fn nothing() -> Result<Outbox, Infallible> {
        Ok(Vec::new())
    }

    #[test]
    fn register_and_unregister() {
        let registry = PresenceRegistry::new();
        let alice = name("alice");
        let (h1, _rx1) = handle();
        let (h2, _rx2) = handle();
        let (c1, c2) = (h1.connection(), h2.connection());
        registry.register(&alice, h1);
        registry.register(&alice, h2);
        assert_eq!(registry.sessions_of(&alice), vec![c1, c2]);
        assert_eq!(registry.connection_count(), 2);
        assert_eq!(registry.identity_of(c1), Some(alice.clone()));

        assert_eq!(registry.unregister(c1), Some(alice.clone()));
        assert_eq!(registry.unregister(c1), None);
        assert!(registry.is_online(&alice));
        assert_eq!(registry.unregister(c2), Some(alice.clone()));
        assert!(!registry.is_online(&alice));
        assert!(registry.sessions_of(&alice).is_empty());
    }

    #[test]
    fn notify_reaches_every_session_of_identity_only() {
        let registry = PresenceRegistry::new();
        let (a1, mut rx_a1) = handle();
        let (a2, mut rx_a2) = handle();
        let (b1, mut rx_b1) = handle();
        registry.register(&name("a"), a1);
        registry.register(&name("a"), a2);
        registry.register(&name("b"), b1);

        assert_eq!(registry.notify(&name("a"), ping()), 2);
        assert_eq!(rx_a1.try_recv().unwrap(), ping());
        assert_eq!(rx_a2.try_recv().unwrap(), ping());
        assert!(rx_b1.try_recv().is_err());
        assert_eq!(registry.notify(&name("nobody"), ping()), 0);
    }

    #[test]
    fn notify_except_skips_sender() {
        let registry = PresenceRegistry::new();
        let (a1, mut rx_a1) = handle();
        let (a2, mut rx_a2) = handle();
        let skip = a1.connection();
        registry.register(&name("a"), a1);
        registry.register(&name("a"), a2);
        assert_eq!(registry.notify_except(&name("a"), skip, ping()), 1);
        assert!(rx_a1.try_recv().is_err());
        assert!(rx_a2.try_recv().is_ok());
    }

    #[test]
    fn send_to_is_point_to_point() {
        let registry = PresenceRegistry::new();
        let (a1, mut rx_a1) = handle();
        let (a2, mut rx_a2) = handle();
        let target = a2.connection();
        registry.register(&name("a"), a1);
        registry.register(&name("a"), a2);
        assert!(registry.send_to(&name("a"), target, ping()));
        assert!(rx_a1.try_recv().is_err());
        assert!(rx_a2.try_recv().is_ok());
        assert!(!registry.send_to(&name("b"), target, ping()));
    }

    #[test]
    fn rebind_moves_whole_group_and_owners() {
        let registry = PresenceRegistry::new();
        let (a1, mut rx) = handle();
        let (a2, _rx2) = handle();
        let (c1, c2) = (a1.connection(), a2.connection());
        registry.register(&name("old"), a1);
        registry.register(&name("old"), a2);
        assert_eq!(registry.rebind(&name("old"), &name("new"), nothing), Ok(2));
        assert!(!registry.is_online(&name("old")));
        assert_eq!(registry.sessions_of(&name("new")).len(), 2);
        assert_eq!(registry.identity_of(c1), Some(name("new")));
        assert_eq!(registry.notify(&name("new"), ping()), 2);
        assert!(rx.try_recv().is_ok());

        // a session that still believes it is "old" unregisters cleanly
        assert_eq!(registry.unregister(c1), Some(name("new")));
        assert_eq!(registry.unregister(c2), Some(name("new")));
        assert!(!registry.is_online(&name("new")));
        assert_eq!(registry.connection_count(), 0);
    }

    #[test]
    fn failed_commit_leaves_layout_alone() {
        let registry = PresenceRegistry::new();
        let (a1, _rx) = handle();
        let c1 = a1.connection();
        registry.register(&name("old"), a1);
        let result = registry.rebind(&name("old"), &name("new"), || Err::<Outbox, _>("store down"));
        assert_eq!(result, Err("store down"));
        assert_eq!(registry.identity_of(c1), Some(name("old")));
        assert!(!registry.is_online(&name("new")));
    }

    #[test]
    fn rebind_outbox_goes_out_under_new_layout() {
        let registry = PresenceRegistry::new();
        let (mover, mut rx_mover) = handle();
        let (friend, mut rx_friend) = handle();
        registry.register(&name("old"), mover);
        registry.register(&name("friend"), friend);
        registry
            .rebind(&name("old"), &name("new"), || {
                Ok::<_, Infallible>(vec![(name("new"), ping()), (name("friend"), ping())])
            })
            .unwrap();
        assert_eq!(rx_mover.try_recv().unwrap(), ping());
        assert_eq!(rx_friend.try_recv().unwrap(), ping());
    }

    #[test]
    fn notify_resolved_delivers_outbox() {
        let registry = PresenceRegistry::new();
        let (a, mut rx_a) = handle();
        registry.register(&name("a"), a);
        let sent = registry
            .notify_resolved(|| Ok::<_, Infallible>(vec![(name("a"), ping()), (name("ghost"), ping())]))
            .unwrap();
        assert_eq!(sent, 1);
        assert!(rx_a.try_recv().is_ok());
        assert_eq!(registry.notify_resolved(|| Err::<Outbox, _>(7)), Err(7));
    }

    #[test]
    fn closed_session_is_dropped_without_affecting_others() {
        let registry = PresenceRegistry::new();
        let (gone, rx_gone) = handle();
        let (alive, mut rx_alive) = handle();
        registry.register(&name("a"), gone);
        registry.register(&name("a"), alive);
        drop(rx_gone);
        assert_eq!(registry.notify(&name("a"), ping()), 1);
        assert!(rx_alive.try_recv().is_ok());
        assert_eq!(registry.connection_count(), 1);
    }

    #[test]
    fn full_queue_drops_and_cancels_session() {
        let registry = PresenceRegistry::new();
        let (slow, _rx, cancel) = handle_with_capacity(1);
        let connection = slow.connection();
        registry.register(&name("a"), slow);
        assert_eq!(registry.notify(&name("a"), ping()), 1);
        assert_eq!(registry.notify(&name("a"), ping()), 0);
        assert!(cancel.is_cancelled());
        assert!(!registry.is_online(&name("a")));
        assert_eq!(registry.identity_of(connection), None);
        // the dropped session still learns who it was when it unregisters
        assert_eq!(registry.unregister(connection), Some(name("a")));
        assert_eq!(registry.unregister(connection), None);
    }

    #[test]
    fn evict_cancels_all_sessions() {
        let registry = PresenceRegistry::new();
        let (h1, _rx1, c1) = handle_with_capacity(4);
        let (h2, _rx2, c2) = handle_with_capacity(4);
        let (peer, mut rx_peer) = handle();
        registry.register(&name("a"), h1);
        registry.register(&name("a"), h2);
        registry.register(&name("peer"), peer);
        let evicted = registry
            .evict(&name("a"), || Ok::<_, Infallible>(vec![(name("peer"), ping())]))
            .unwrap();
        assert_eq!(evicted, 2);
        assert!(c1.is_cancelled() && c2.is_cancelled());
        assert!(!registry.is_online(&name("a")));
        assert_eq!(rx_peer.try_recv().unwrap(), ping());
        assert_eq!(registry.evict(&name("a"), nothing), Ok(0));
    }

    #[test]
    fn status_is_in_game_if_any_session_is() {
        let registry = PresenceRegistry::new();
        let (h1, _rx1) = handle();
        let (h2, _rx2) = handle();
        let (c1, c2) = (h1.connection(), h2.connection());
        assert_eq!(registry.status_of(&name("a")), FriendStatus::Disconnected);
        registry.register(&name("a"), h1);
        registry.register(&name("a"), h2);
        assert_eq!(registry.status_of(&name("a")), FriendStatus::Connected);
        registry.set_status(c1, FriendStatus::InGame);
        assert_eq!(registry.status_of(&name("a")), FriendStatus::InGame);
        registry.unregister(c1);
        assert_eq!(registry.status_of(&name("a")), FriendStatus::Connected);
        registry.set_status(c2, FriendStatus::InGame);
        assert_eq!(registry.status_of(&name("a")), FriendStatus::InGame);
    }

    #[test]
    fn connection_ids_are_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
        assert!(ConnectionId::new().to_string().starts_with("conn_"));
    }
}
