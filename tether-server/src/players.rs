use sled::transaction::{abort, ConflictableTransactionResult, TransactionalTree};
use sled::{Db, Transactional, Tree};
use tether_common::non_api_structs::Player;
use tether_common::Username;

use crate::error::DirectoryError;

pub(crate) type TxResult<T> = ConflictableTransactionResult<T, DirectoryError>;

/// Account lookups the presence engine needs. Passwords never pass through here.
pub trait PlayerDirectory: Send + Sync {
    fn get_player(&self, username: &Username) -> Result<Option<Player>, DirectoryError>;

    fn player_exists(&self, username: &Username) -> Result<bool, DirectoryError> {
        Ok(self.get_player(username)?.is_some())
    }
}

/// Player accounts kept in sled, with a reverse index of tournament aliases.
#[derive(Clone)]
pub struct Players {
    players: Tree,
    aliases: Tree,
}

impl Players {
    pub fn open(db: &Db) -> Result<Self, DirectoryError> {
        Ok(Self {
            players: db.open_tree("players")?,
            aliases: db.open_tree("aliases")?,
        })
    }

    /// The `players` and `aliases` trees, for transactions spanning relations.
    pub(crate) fn trees(&self) -> (&Tree, &Tree) {
        (&self.players, &self.aliases)
    }

    pub fn create_player(&self, username: Username) -> Result<Player, DirectoryError> {
        let player = Player::new(username);
        self.players.transaction(|players| {
            if players.get(key(&player.username))?.is_some() {
                return abort(DirectoryError::UsernameTaken(player.username.clone()));
            }
            save(players, &player)
        })?;
        Ok(player)
    }

    /// Sets or, with `None` or an empty string, clears the tournament alias.
    pub fn set_tournament_alias(
        &self,
        username: &Username,
        alias: Option<String>,
    ) -> Result<Player, DirectoryError> {
        let alias = alias.filter(|a| !a.is_empty());
        if let Some(alias) = &alias {
            if Username::parse(alias).is_err() {
                return Err(DirectoryError::InvalidAlias(alias.clone()));
            }
        }
        let player = (&self.players, &self.aliases).transaction(|(players, aliases)| {
            let mut player = load(players, username)?;
            if player.tournament_alias == alias {
                return Ok(player);
            }
            if let Some(alias) = &alias {
                if aliases.get(alias.as_bytes())?.is_some() {
                    return abort(DirectoryError::AliasTaken(alias.clone()));
                }
                aliases.insert(alias.as_bytes(), key(username))?;
            }
            if let Some(previous) = &player.tournament_alias {
                aliases.remove(previous.as_bytes())?;
            }
            player.tournament_alias = alias.clone();
            save(players, &player)?;
            Ok(player)
        })?;
        Ok(player)
    }
}

impl PlayerDirectory for Players {
    fn get_player(&self, username: &Username) -> Result<Option<Player>, DirectoryError> {
        match self.players.get(key(username))? {
            Some(raw) => Ok(Some(serde_json::from_slice(&raw)?)),
            None => Ok(None),
        }
    }

    fn player_exists(&self, username: &Username) -> Result<bool, DirectoryError> {
        Ok(self.players.contains_key(key(username))?)
    }
}

/// Moves the player record and its alias entry. Fails with
/// [`DirectoryError::UsernameTaken`] when `new` is in use.
pub(crate) fn rename_in(
    players: &TransactionalTree,
    aliases: &TransactionalTree,
    old: &Username,
    new: &Username,
) -> TxResult<()> {
    let mut player = load(players, old)?;
    if players.get(key(new))?.is_some() {
        return abort(DirectoryError::UsernameTaken(new.clone()));
    }
    players.remove(key(old))?;
    player.username = new.clone();
    if let Some(alias) = &player.tournament_alias {
        aliases.insert(alias.as_bytes(), key(new))?;
    }
    save(players, &player)
}

pub(crate) fn delete_in(players: &TransactionalTree, aliases: &TransactionalTree, username: &Username) -> TxResult<bool> {
    let Some(raw) = players.remove(key(username))? else {
        return Ok(false);
    };
    let player: Player = serde_json::from_slice(&raw).or_else(|e| abort(DirectoryError::from(e)))?;
    if let Some(alias) = &player.tournament_alias {
        aliases.remove(alias.as_bytes())?;
    }
    Ok(true)
}

fn key(username: &Username) -> &[u8] {
    username.as_str().as_bytes()
}

fn load(players: &TransactionalTree, username: &Username) -> TxResult<Player> {
    match players.get(key(username))? {
        Some(raw) => serde_json::from_slice(&raw).or_else(|e| abort(DirectoryError::from(e))),
        None => abort(DirectoryError::NotFound(username.clone())),
    }
}

fn save(players: &TransactionalTree, player: &Player) -> TxResult<()> {
    let raw = serde_json::to_vec(player).or_else(|e| abort(DirectoryError::from(e)))?;
    players.insert(key(&player.username), raw)?;
    Ok(())
}
