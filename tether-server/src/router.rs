use std::sync::Arc;

use tether_common::{ClientCommand, FriendStatus, Snapshot, Username};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::accounts::Accounts;
use crate::error::{DirectoryError, RouterError, StoreError};
use crate::players::{PlayerDirectory, Players};
use crate::registry::{ConnectionId, Notification, Outbox, PresenceRegistry, SessionHandle};
use crate::session::Session;
use crate::snapshot::SnapshotBuilder;
use crate::store::RelationshipStore;

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Reply {
    Snapshot,
    Renamed { from: Username, to: Username },
    Close,
}

pub struct Attached {
    pub session: Session,
    pub notifications: mpsc::Receiver<Notification>,
    pub cancel: CancellationToken,
}

pub struct EventRouter {
    store: Arc<RelationshipStore>,
    players: Arc<Players>,
    accounts: Accounts,
    presence: Arc<PresenceRegistry>,
    snapshots: SnapshotBuilder,
    outbound_capacity: usize,
}

impl EventRouter {
    pub fn new(
        store: Arc<RelationshipStore>,
        players: Arc<Players>,
        presence: Arc<PresenceRegistry>,
        outbound_capacity: usize,
    ) -> Self {
        Self {
            snapshots: SnapshotBuilder::new(Arc::clone(&store)),
            accounts: Accounts::new(Arc::clone(&players), Arc::clone(&store)),
            store,
            players,
            presence,
            outbound_capacity: outbound_capacity.max(1),
        }
    }

    pub fn presence(&self) -> &PresenceRegistry {
        &self.presence
    }

    pub fn connect(&self, identity: Username) -> Option<Attached> {
        if !self.exists(&identity) {
            debug!(username = %identity, "refusing session for unknown player");
            return None;
        }
        let connection = ConnectionId::new();
        let (tx, notifications) = mpsc::channel(self.outbound_capacity);
        let cancel = CancellationToken::new();
        self.presence
            .register(&identity, SessionHandle::new(connection, tx, cancel.clone()));

        // the player may have been deleted while we registered
        if !self.exists(&identity) {
            self.presence.unregister(connection);
            return None;
        }

        let status = self.presence.status_of(&identity);
        let probed = self
            .presence
            .notify_resolved(|| {
                let friends = self.store.friends_of(&identity)?;
                Ok::<_, StoreError>(
                    friends
                        .into_iter()
                        .map(|friend| {
                            let probe = Notification::Probe {
                                asker: identity.clone(),
                                status,
                                reply_to: connection,
                            };
                            (friend, probe)
                        })
                        .collect(),
                )
            })
            .unwrap_or_else(|err| {
                warn!(username = %identity, error = %err, "cannot probe friends");
                0
            });
        info!(username = %identity, %connection, probed, "session connected");
        Some(Attached {
            session: Session::new(connection, identity),
            notifications,
            cancel,
        })
    }

    /// Idempotent. Friends hear about it once the player's last session is
    /// gone, including when this one was already dropped for a transport fault.
    pub fn disconnect(&self, session: &Session) {
        let Some(identity) = self.presence.unregister(session.connection()) else {
            return;
        };
        info!(username = %identity, connection = %session.connection(), "session disconnected");
        if self.presence.is_online(&identity) || !self.exists(&identity) {
            return;
        }
        self.broadcast_status(&identity, FriendStatus::Disconnected);
    }

    pub fn snapshot(&self, session: &Session) -> Result<Snapshot, StoreError> {
        self.snapshots.build(session)
    }

    pub fn handle_command(&self, session: &mut Session, command: ClientCommand) -> Reply {
        // a sibling may have renamed us before our notice was read
        let Some(current) = self.presence.identity_of(session.connection()) else {
            debug!(username = %session.identity(), "session no longer registered");
            return Reply::Close;
        };
        if &current != session.identity() {
            session.rebind(current);
        }
        if !self.exists(session.identity()) {
            return Reply::Close;
        }

        debug!(username = %session.identity(), verb = command.verb(), "command");
        let result = match command {
            ClientCommand::RequestNewFriend(target) => {
                self.with_target(session, &target, Self::request_new_friend)
            }
            ClientCommand::RemoveFriend(target) => self.with_target(session, &target, Self::remove_friend),
            ClientCommand::CancelFriendRequest(target) => {
                self.with_target(session, &target, Self::cancel_friend_request)
            }
            ClientCommand::AcceptFriendRequest(target) => {
                self.with_target(session, &target, Self::accept_friend_request)
            }
            ClientCommand::RefuseFriendRequest(target) => {
                self.with_target(session, &target, Self::refuse_friend_request)
            }
            ClientCommand::Rename(new_name) => self.rename(session, &new_name),
            ClientCommand::DeleteUser => self.delete_user(session),
            ClientCommand::InGame => Ok(self.set_status(session, FriendStatus::InGame)),
            ClientCommand::GameDone => Ok(self.set_status(session, FriendStatus::Connected)),
            ClientCommand::Other(_) => Ok(Reply::Snapshot),
        };
        match result {
            Ok(reply) => reply,
            Err(error) => {
                warn!(username = %session.identity(), %error, "command failed, state unchanged");
                Reply::Snapshot
            }
        }
    }

    pub fn handle_notification(&self, session: &mut Session, notification: Notification) -> Reply {
        match notification {
            Notification::UpdateRelationship { reset } => {
                if let Some(peer) = reset {
                    session.update_status(peer, FriendStatus::Disconnected);
                }
                Reply::Snapshot
            }
            Notification::FriendStatus { friend, status } => {
                session.update_status(friend, status);
                Reply::Snapshot
            }
            Notification::Probe { asker, status, reply_to } => {
                match self.store.are_friends(session.identity(), &asker) {
                    Ok(true) => {
                        session.update_status(asker.clone(), status);
                        self.presence.send_to(
                            &asker,
                            reply_to,
                            Notification::FriendStatus {
                                friend: session.identity().clone(),
                                status: self.presence.status_of(session.identity()),
                            },
                        );
                    }
                    Ok(false) => debug!(username = %session.identity(), %asker, "ignoring probe from non-friend"),
                    Err(error) => warn!(username = %session.identity(), %asker, %error, "cannot answer probe"),
                }
                Reply::Snapshot
            }
            Notification::Renamed { from, to } => {
                // `to` matches when a command already picked up the new name
                if &from == session.identity() || &to == session.identity() {
                    session.rebind(to.clone());
                    Reply::Renamed { from, to }
                } else {
                    session.forget(&from);
                    Reply::Snapshot
                }
            }
        }
    }

    /// Account-deletion hook: removes the player and every relation in one
    /// transaction, closes the player's sessions and tells each former peer
    /// once. Returns whether the player existed.
    pub fn on_player_deleted(&self, username: &Username) -> Result<bool, RouterError> {
        let mut former = None;
        let evicted = self.presence.evict(username, || {
            let Some(relations) = self.accounts.delete(username)? else {
                return Ok::<_, RouterError>(Outbox::new());
            };
            let outbox = relations
                .peers()
                .into_iter()
                .map(|peer| {
                    let reset = relations.friends.contains(&peer).then(|| username.clone());
                    (peer, Notification::UpdateRelationship { reset })
                })
                .collect();
            former = Some(relations);
            Ok(outbox)
        })?;
        let Some(former) = former else {
            return Ok(false);
        };
        info!(%username, friends = former.friends.len(), evicted, "player deleted");
        Ok(true)
    }

    fn with_target(
        &self,
        session: &mut Session,
        raw: &str,
        handler: fn(&Self, &mut Session, Username) -> Result<Reply, RouterError>,
    ) -> Result<Reply, RouterError> {
        let target = match Username::parse(raw) {
            Ok(target) if self.players.player_exists(&target)? => target,
            _ => {
                debug!(username = %session.identity(), target = raw, "unknown target");
                return Ok(Reply::Snapshot);
            }
        };
        handler(self, session, target)
    }

    /// Commits `change` and addresses `outbox` under one registry read lock,
    /// so a concurrent rename cannot slip between the two.
    fn commit_then_notify(
        &self,
        change: impl FnOnce() -> Result<bool, RouterError>,
        outbox: impl FnOnce() -> Outbox,
    ) -> Result<bool, RouterError> {
        let mut changed = false;
        self.presence.notify_resolved(|| {
            changed = change()?;
            Ok::<_, RouterError>(if changed { outbox() } else { Outbox::new() })
        })?;
        Ok(changed)
    }

    fn request_new_friend(&self, session: &mut Session, target: Username) -> Result<Reply, RouterError> {
        let me = session.identity().clone();
        let changed = self.commit_then_notify(
            || self.accounts.create_request(&me, &target),
            || vec![(target.clone(), Notification::UpdateRelationship { reset: None })],
        )?;
        if changed {
            self.tell_siblings(session, Notification::UpdateRelationship { reset: None });
        }
        Ok(Reply::Snapshot)
    }

    fn remove_friend(&self, session: &mut Session, target: Username) -> Result<Reply, RouterError> {
        let me = session.identity().clone();
        let changed = self.commit_then_notify(
            || Ok(self.store.remove_friendship(&me, &target)?),
            || vec![(target.clone(), Notification::UpdateRelationship { reset: Some(me.clone()) })],
        )?;
        if changed {
            session.forget(&target);
            self.tell_siblings(session, Notification::UpdateRelationship { reset: Some(target) });
        }
        Ok(Reply::Snapshot)
    }

    fn cancel_friend_request(&self, session: &mut Session, target: Username) -> Result<Reply, RouterError> {
        let me = session.identity().clone();
        let changed = self.commit_then_notify(
            || Ok(self.store.delete_request(&me, &target)?),
            || vec![(target.clone(), Notification::UpdateRelationship { reset: None })],
        )?;
        if changed {
            self.tell_siblings(session, Notification::UpdateRelationship { reset: None });
        }
        Ok(Reply::Snapshot)
    }

    fn accept_friend_request(&self, session: &mut Session, target: Username) -> Result<Reply, RouterError> {
        let me = session.identity().clone();
        let probe = Notification::Probe {
            asker: me.clone(),
            status: self.presence.status_of(&me),
            reply_to: session.connection(),
        };
        let changed = self.commit_then_notify(
            || Ok(self.store.accept_request(&target, &me)?),
            || {
                vec![
                    (target.clone(), probe),
                    (target.clone(), Notification::UpdateRelationship { reset: None }),
                ]
            },
        )?;
        if changed {
            self.tell_siblings(session, Notification::UpdateRelationship { reset: None });
        }
        Ok(Reply::Snapshot)
    }

    fn refuse_friend_request(&self, session: &mut Session, target: Username) -> Result<Reply, RouterError> {
        let me = session.identity().clone();
        let changed = self.commit_then_notify(
            || Ok(self.store.delete_request(&target, &me)?),
            || vec![(target.clone(), Notification::UpdateRelationship { reset: None })],
        )?;
        if changed {
            self.tell_siblings(session, Notification::UpdateRelationship { reset: None });
        }
        Ok(Reply::Snapshot)
    }

    fn rename(&self, session: &mut Session, raw: &str) -> Result<Reply, RouterError> {
        let Ok(new) = Username::parse(raw) else {
            debug!(username = %session.identity(), requested = raw, "invalid new username");
            return Ok(Reply::Snapshot);
        };
        let old = session.identity().clone();
        if new == old {
            return Ok(Reply::Snapshot);
        }
        let status = self.presence.status_of(&old);
        let moved = self.presence.rebind(&old, &new, || {
            let relations = self.accounts.rename(&old, &new)?;
            let mut outbox = Outbox::new();
            for friend in &relations.friends {
                let gone = Notification::FriendStatus {
                    friend: old.clone(),
                    status: FriendStatus::Disconnected,
                };
                outbox.push((friend.clone(), gone));
            }
            for friend in &relations.friends {
                let back = Notification::FriendStatus {
                    friend: new.clone(),
                    status,
                };
                outbox.push((friend.clone(), back));
            }
            for peer in relations.peers() {
                let renamed = Notification::Renamed {
                    from: old.clone(),
                    to: new.clone(),
                };
                outbox.push((peer, renamed));
            }
            Ok::<_, RouterError>(outbox)
        });
        match moved {
            Ok(sessions) => info!(username = %old, renamed_to = %new, sessions, "player renamed"),
            Err(RouterError::Directory(DirectoryError::UsernameTaken(_))) => {
                debug!(username = %old, requested = %new, "username already used");
                return Ok(Reply::Snapshot);
            }
            Err(err) => return Err(err),
        }
        session.rebind(new.clone());
        self.tell_siblings(
            session,
            Notification::Renamed {
                from: old.clone(),
                to: new.clone(),
            },
        );
        Ok(Reply::Renamed { from: old, to: new })
    }

    fn delete_user(&self, session: &mut Session) -> Result<Reply, RouterError> {
        self.on_player_deleted(session.identity())?;
        Ok(Reply::Close)
    }

    fn set_status(&self, session: &mut Session, status: FriendStatus) -> Reply {
        session.set_own_status(status);
        self.presence.set_status(session.connection(), status);
        self.broadcast_status(session.identity(), self.presence.status_of(session.identity()));
        Reply::Snapshot
    }

    fn broadcast_status(&self, identity: &Username, status: FriendStatus) {
        let sent = self.presence.notify_resolved(|| {
            let friends = self.store.friends_of(identity)?;
            Ok::<_, StoreError>(
                friends
                    .into_iter()
                    .map(|peer| {
                        let update = Notification::FriendStatus {
                            friend: identity.clone(),
                            status,
                        };
                        (peer, update)
                    })
                    .collect(),
            )
        });
        if let Err(err) = sent {
            warn!(username = %identity, error = %err, "cannot list friends");
        }
    }

    fn tell_siblings(&self, session: &Session, notification: Notification) {
        self.presence
            .notify_except(session.identity(), session.connection(), notification);
    }

    fn exists(&self, identity: &Username) -> bool {
        self.players.player_exists(identity).unwrap_or_else(|err| {
            warn!(username = %identity, error = %err, "player lookup failed");
            false
        })
    }
}
