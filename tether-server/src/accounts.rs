use std::sync::Arc;

use sled::transaction::{ConflictableTransactionError, ConflictableTransactionResult};
use sled::Transactional;
use tether_common::non_api_structs::Relations;
use tether_common::Username;

use crate::error::RouterError;
use crate::players::{self, Players};
use crate::store::{self, RelationshipStore};

/// Changes that touch a player record and the relations graph together. Each
/// runs as one sled transaction over the `relations`, `players` and `aliases`
/// trees.
#[derive(Clone)]
pub struct Accounts {
    players: Arc<Players>,
    store: Arc<RelationshipStore>,
}

impl Accounts {
    pub fn new(players: Arc<Players>, store: Arc<RelationshipStore>) -> Self {
        Self { players, store }
    }

    /// Returns the relations now stored under `new`.
    pub fn rename(&self, old: &Username, new: &Username) -> Result<Relations, RouterError> {
        let (players, aliases) = self.players.trees();
        let moved = (self.store.tree(), players, aliases).transaction(|(relations, players, aliases)| {
            lift(players::rename_in(players, aliases, old, new))?;
            lift(store::rename_in(relations, old, new))
        })?;
        Ok(moved)
    }

    /// `None` when there was no such player.
    pub fn delete(&self, player: &Username) -> Result<Option<Relations>, RouterError> {
        let (players, aliases) = self.players.trees();
        let former = (self.store.tree(), players, aliases).transaction(|(relations, players, aliases)| {
            if !lift(players::delete_in(players, aliases, player))? {
                return Ok(None);
            }
            lift(store::purge_in(relations, player)).map(Some)
        })?;
        Ok(former)
    }

    /// Records `from -> to` only while both players exist.
    pub fn create_request(&self, from: &Username, to: &Username) -> Result<bool, RouterError> {
        let (players, _) = self.players.trees();
        let created = (self.store.tree(), players).transaction(|(relations, players)| {
            for player in [from, to] {
                if players.get(player.as_str().as_bytes())?.is_none() {
                    return Ok(false);
                }
            }
            lift(store::request_in(relations, from, to))
        })?;
        Ok(created)
    }
}

fn lift<T, E: Into<RouterError>>(
    result: ConflictableTransactionResult<T, E>,
) -> ConflictableTransactionResult<T, RouterError> {
    result.map_err(|err| match err {
        ConflictableTransactionError::Abort(err) => ConflictableTransactionError::Abort(err.into()),
        ConflictableTransactionError::Storage(err) => ConflictableTransactionError::Storage(err),
        ConflictableTransactionError::Conflict => ConflictableTransactionError::Conflict,
    })
}
