use sled::transaction::{abort, ConflictableTransactionResult, TransactionalTree};
use sled::{Db, Tree};
use tether_common::non_api_structs::Relations;
use tether_common::Username;

use crate::error::StoreError;

pub(crate) type TxResult<T> = ConflictableTransactionResult<T, StoreError>;

/// Friendships and requests, one JSON [`Relations`] record per player. Both
/// endpoints of a pairwise change are written in one transaction.
#[derive(Clone)]
pub struct RelationshipStore {
    tree: Tree,
}

impl RelationshipStore {
    pub fn open(db: &Db) -> Result<Self, StoreError> {
        Ok(Self {
            tree: db.open_tree("relations")?,
        })
    }

    pub(crate) fn tree(&self) -> &Tree {
        &self.tree
    }

    pub fn relations(&self, player: &Username) -> Result<Relations, StoreError> {
        match self.tree.get(player.as_str().as_bytes())? {
            Some(raw) => Ok(serde_json::from_slice(&raw)?),
            None => Ok(Relations::default()),
        }
    }

    pub fn knows(&self, player: &Username) -> Result<bool, StoreError> {
        Ok(self.tree.contains_key(player.as_str().as_bytes())?)
    }

    pub fn are_friends(&self, a: &Username, b: &Username) -> Result<bool, StoreError> {
        Ok(self.relations(a)?.friends.contains(b))
    }

    pub fn friends_of(&self, player: &Username) -> Result<Vec<Username>, StoreError> {
        Ok(self.relations(player)?.friends)
    }

    pub fn pending_sent(&self, player: &Username) -> Result<Vec<Username>, StoreError> {
        Ok(self.relations(player)?.sent)
    }

    pub fn pending_received(&self, player: &Username) -> Result<Vec<Username>, StoreError> {
        Ok(self.relations(player)?.received)
    }

    pub fn request_exists(&self, from: &Username, to: &Username) -> Result<bool, StoreError> {
        Ok(self.relations(from)?.sent.contains(to))
    }

    pub fn add_friendship(&self, a: &Username, b: &Username) -> Result<(), StoreError> {
        if a == b {
            return Err(StoreError::SelfRelation);
        }
        self.transact(|tx| {
            let mut left = load(tx, a)?;
            if left.friends.contains(b) {
                return abort(StoreError::AlreadyFriends(a.clone(), b.clone()));
            }
            let mut right = load(tx, b)?;
            befriend(&mut left, b);
            befriend(&mut right, a);
            save(tx, a, &left)?;
            save(tx, b, &right)
        })
    }

    pub fn remove_friendship(&self, a: &Username, b: &Username) -> Result<bool, StoreError> {
        self.transact(|tx| {
            let mut left = load(tx, a)?;
            if !left.friends.contains(b) {
                return Ok(false);
            }
            let mut right = load(tx, b)?;
            left.friends.retain(|f| f != b);
            right.friends.retain(|f| f != a);
            save(tx, a, &left)?;
            save(tx, b, &right)?;
            Ok(true)
        })
    }

    /// Records `from -> to`. Self requests, duplicates and requests between
    /// friends are no-ops; the return value says whether a request was made.
    pub fn create_request(&self, from: &Username, to: &Username) -> Result<bool, StoreError> {
        self.transact(|tx| request_in(tx, from, to))
    }

    pub fn delete_request(&self, from: &Username, to: &Username) -> Result<bool, StoreError> {
        self.transact(|tx| {
            let mut sender = load(tx, from)?;
            if !sender.sent.contains(to) {
                return Ok(false);
            }
            let mut receiver = load(tx, to)?;
            sender.sent.retain(|r| r != to);
            receiver.received.retain(|r| r != from);
            save(tx, from, &sender)?;
            save(tx, to, &receiver)?;
            Ok(true)
        })
    }

    /// Turns the request `from -> to` into a friendship. Any request in the
    /// opposite direction goes away too.
    pub fn accept_request(&self, from: &Username, to: &Username) -> Result<bool, StoreError> {
        self.transact(|tx| {
            let mut sender = load(tx, from)?;
            if !sender.sent.contains(to) {
                return Ok(false);
            }
            let mut receiver = load(tx, to)?;
            befriend(&mut sender, to);
            befriend(&mut receiver, from);
            save(tx, from, &sender)?;
            save(tx, to, &receiver)?;
            Ok(true)
        })
    }

    pub fn rename(&self, old: &Username, new: &Username) -> Result<(), StoreError> {
        self.transact(|tx| rename_in(tx, old, new).map(drop))
    }

    pub fn purge(&self, player: &Username) -> Result<Relations, StoreError> {
        self.transact(|tx| purge_in(tx, player))
    }

    fn transact<T>(&self, f: impl Fn(&TransactionalTree) -> TxResult<T>) -> Result<T, StoreError> {
        Ok(self.tree.transaction(f)?)
    }
}

pub(crate) fn request_in(tx: &TransactionalTree, from: &Username, to: &Username) -> TxResult<bool> {
    if from == to {
        return Ok(false);
    }
    let mut sender = load(tx, from)?;
    if sender.sent.contains(to) || sender.friends.contains(to) {
        return Ok(false);
    }
    let mut receiver = load(tx, to)?;
    sender.sent.push(to.clone());
    receiver.received.push(from.clone());
    save(tx, from, &sender)?;
    save(tx, to, &receiver)?;
    Ok(true)
}

pub(crate) fn rename_in(tx: &TransactionalTree, old: &Username, new: &Username) -> TxResult<Relations> {
    let own = load(tx, old)?;
    if old == new {
        return Ok(own);
    }
    if tx.get(new.as_str().as_bytes())?.is_some() {
        return abort(StoreError::IdentityInUse(new.clone()));
    }
    for peer in own.peers() {
        let mut theirs = load(tx, &peer)?;
        theirs.rename_peer(old, new);
        save(tx, &peer, &theirs)?;
    }
    tx.remove(old.as_str().as_bytes())?;
    save(tx, new, &own)?;
    Ok(own)
}

pub(crate) fn purge_in(tx: &TransactionalTree, player: &Username) -> TxResult<Relations> {
    let own = load(tx, player)?;
    for peer in own.peers() {
        let mut theirs = load(tx, &peer)?;
        theirs.forget_peer(player);
        save(tx, &peer, &theirs)?;
    }
    tx.remove(player.as_str().as_bytes())?;
    Ok(own)
}

fn befriend(relations: &mut Relations, friend: &Username) {
    relations.sent.retain(|r| r != friend);
    relations.received.retain(|r| r != friend);
    if !relations.friends.contains(friend) {
        relations.friends.push(friend.clone());
    }
}

fn load(tx: &TransactionalTree, player: &Username) -> TxResult<Relations> {
    match tx.get(player.as_str().as_bytes())? {
        Some(raw) => serde_json::from_slice(&raw).or_else(|e| abort(StoreError::from(e))),
        None => Ok(Relations::default()),
    }
}

fn save(tx: &TransactionalTree, player: &Username, relations: &Relations) -> TxResult<()> {
    let key = player.as_str().as_bytes();
    if relations.is_empty() {
        tx.remove(key)?;
    } else {
        let raw = serde_json::to_vec(relations).or_else(|e| abort(StoreError::from(e)))?;
        tx.insert(key, raw)?;
    }
    Ok(())
}
