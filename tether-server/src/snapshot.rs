use std::sync::Arc;

use tether_common::non_api_structs::Relations;
use tether_common::Snapshot;

use crate::error::StoreError;
use crate::session::Session;
use crate::store::RelationshipStore;

/// Builds the payload a session pushes to its own client.
#[derive(Clone)]
pub struct SnapshotBuilder {
    store: Arc<RelationshipStore>,
}

impl SnapshotBuilder {
    pub fn new(store: Arc<RelationshipStore>) -> Self {
        Self { store }
    }

    pub fn build(&self, session: &Session) -> Result<Snapshot, StoreError> {
        let relations = self.store.relations(session.identity())?;
        Ok(assemble(&relations, session))
    }
}

/// Friends are ordered by status; the sort is stable, so equal statuses keep
/// the order the friendships were made in.
pub fn assemble(relations: &Relations, session: &Session) -> Snapshot {
    let mut friends_list: Vec<_> = relations
        .friends
        .iter()
        .map(|friend| (friend.clone(), session.status_of(friend)))
        .collect();
    friends_list.sort_by_key(|(_, status)| *status);
    Snapshot {
        friends_list,
        friends_request_send: relations.sent.clone(),
        friends_request_received: relations.received.clone(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::registry::ConnectionId;
    use tether_common::{FriendStatus, Username};

    fn name(s: &str) -> Username {
        Username::parse(s).unwrap()
    }

    #[test]
    fn sorted_by_status_then_insertion() {
        let relations = Relations {
            friends: ["d1", "g1", "c1", "d2", "c2"].into_iter().map(name).collect(),
            sent: vec![name("s")],
            received: vec![name("r")],
        };
        let mut session = Session::new(ConnectionId::new(), name("me"));
        session.update_status(name("g1"), FriendStatus::InGame);
        session.update_status(name("c1"), FriendStatus::Connected);
        session.update_status(name("c2"), FriendStatus::Connected);
        session.update_status(name("stale"), FriendStatus::Connected);

        let snapshot = assemble(&relations, &session);
        let order: Vec<_> = snapshot
            .friends_list
            .iter()
            .map(|(n, s)| (n.as_str().to_string(), *s))
            .collect();
        assert_eq!(
            order,
            vec![
                ("c1".to_string(), FriendStatus::Connected),
                ("c2".to_string(), FriendStatus::Connected),
                ("d1".to_string(), FriendStatus::Disconnected),
                ("d2".to_string(), FriendStatus::Disconnected),
                ("g1".to_string(), FriendStatus::InGame),
            ]
        );
        assert_eq!(snapshot.friends_request_send, vec![name("s")]);
        assert_eq!(snapshot.friends_request_received, vec![name("r")]);
    }

    #[test]
    fn build_is_deterministic() {
        let db = sled::Config::new().temporary(true).open().unwrap();
        let store = Arc::new(RelationshipStore::open(&db).unwrap());
        for friend in ["x", "y", "z"] {
            store.add_friendship(&name("me"), &name(friend)).unwrap();
        }
        store.create_request(&name("me"), &name("w")).unwrap();
        let mut session = Session::new(ConnectionId::new(), name("me"));
        session.update_status(name("y"), FriendStatus::Connected);

        let builder = SnapshotBuilder::new(store);
        let first = builder.build(&session).unwrap();
        let second = builder.build(&session).unwrap();
        assert_eq!(first, second);
        assert_eq!(
            serde_json::to_string(&first).unwrap(),
            serde_json::to_string(&second).unwrap()
        );
        assert_eq!(first.status_of(&name("y")), Some(FriendStatus::Connected));
        assert_eq!(first.status_of(&name("x")), Some(FriendStatus::Disconnected));
    }
}
