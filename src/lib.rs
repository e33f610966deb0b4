pub mod non_api_structs;

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Usernames are capped below this many characters.
pub const MAX_USERNAME_LEN: usize = 64;

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("malformed message: {0}")]
    Malformed(#[from] serde_json::Error),
    #[error("message must be a non-empty array starting with a verb")]
    NotACommand,
    #[error("{verb} expects a string argument")]
    MissingArgument { verb: &'static str },
    #[error("invalid username {0:?}")]
    InvalidUsername(String),
}

#[derive(Eq, PartialEq, Ord, PartialOrd, Hash, Clone, Debug, Serialize, Deserialize, Default)]
pub struct Url(pub String);

impl Url {
    pub fn join(&self, path: impl AsRef<str>) -> String {
        self.0.trim_end_matches('/').to_string() + path.as_ref()
    }
    pub fn websocket(&self) -> Url {
        match self.0.split_once("://") {
            Some(("https", rest)) => Url(String::from("wss://") + rest),
            Some((_, rest)) => Url(String::from("ws://") + rest),
            None => Url(String::from("ws://") + &self.0),
        }
    }
}

/// A player's identity. Only alphanumerics, `.`, `-` and `_` are allowed.
#[derive(Eq, PartialEq, Ord, PartialOrd, Hash, Clone, Debug, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Username(String);

impl Username {
    pub fn parse(string: impl AsRef<str>) -> Result<Self, ProtocolError> {
        let string = string.as_ref();
        let valid = !string.is_empty()
            && string.chars().count() < MAX_USERNAME_LEN
            && string
                .chars()
                .all(|c| c.is_alphanumeric() || matches!(c, '.' | '-' | '_'));
        if valid {
            Ok(Self(string.to_string()))
        } else {
            Err(ProtocolError::InvalidUsername(string.to_string()))
        }
    }
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl AsRef<Username> for Username {
    fn as_ref(&self) -> &Username {
        self
    }
}

impl AsRef<str> for Username {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for Username {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for Username {
    type Error = ProtocolError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::parse(value)
    }
}

impl From<Username> for String {
    fn from(value: Username) -> Self {
        value.0
    }
}

/// What a session knows about one friend. The declaration order is the
/// order friends are listed in a [`Snapshot`].
#[derive(Eq, PartialEq, Ord, PartialOrd, Hash, Clone, Copy, Debug, Serialize, Deserialize, Default)]
pub enum FriendStatus {
    #[serde(rename = "connected")]
    Connected,
    #[default]
    #[serde(rename = "disconnected")]
    Disconnected,
    #[serde(rename = "in-game", alias = "in game")]
    InGame,
}

/// An inbound client message, decoded from `[verb, args...]`.
///
/// Targets are kept as raw strings: whether they name a real player is the
/// router's call, not the decoder's.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ClientCommand {
    RequestNewFriend(String),
    RemoveFriend(String),
    CancelFriendRequest(String),
    AcceptFriendRequest(String),
    RefuseFriendRequest(String),
    Rename(String),
    DeleteUser,
    InGame,
    GameDone,
    Other(String),
}

impl ClientCommand {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        let value: Value = serde_json::from_str(text)?;
        let items = value.as_array().ok_or(ProtocolError::NotACommand)?;
        let verb = items
            .first()
            .and_then(Value::as_str)
            .ok_or(ProtocolError::NotACommand)?;
        let argument = |verb: &'static str| {
            items
                .get(1)
                .and_then(Value::as_str)
                .map(str::to_string)
                .ok_or(ProtocolError::MissingArgument { verb })
        };
        Ok(match verb {
            "request_new_friend" => Self::RequestNewFriend(argument("request_new_friend")?),
            "remove_friend" => Self::RemoveFriend(argument("remove_friend")?),
            "cancel_friend_request" => Self::CancelFriendRequest(argument("cancel_friend_request")?),
            "accept_friend_request" => Self::AcceptFriendRequest(argument("accept_friend_request")?),
            "refuse_friend_request" => Self::RefuseFriendRequest(argument("refuse_friend_request")?),
            "rename" | "update_username" => Self::Rename(argument("rename")?),
            "delete_user" => Self::DeleteUser,
            "in_game" | "in game" => Self::InGame,
            "game_done" | "game done" => Self::GameDone,
            other => Self::Other(other.to_string()),
        })
    }

    pub fn verb(&self) -> &str {
        match self {
            Self::RequestNewFriend(_) => "request_new_friend",
            Self::RemoveFriend(_) => "remove_friend",
            Self::CancelFriendRequest(_) => "cancel_friend_request",
            Self::AcceptFriendRequest(_) => "accept_friend_request",
            Self::RefuseFriendRequest(_) => "refuse_friend_request",
            Self::Rename(_) => "rename",
            Self::DeleteUser => "delete_user",
            Self::InGame => "in_game",
            Self::GameDone => "game_done",
            Self::Other(verb) => verb,
        }
    }

    pub fn encode(&self) -> String {
        let value = match self {
            Self::RequestNewFriend(target)
            | Self::RemoveFriend(target)
            | Self::CancelFriendRequest(target)
            | Self::AcceptFriendRequest(target)
            | Self::RefuseFriendRequest(target)
            | Self::Rename(target) => serde_json::json!([self.verb(), target]),
            _ => serde_json::json!([self.verb()]),
        };
        value.to_string()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Default, Eq, PartialEq)]
pub struct Snapshot {
    pub friends_list: Vec<(Username, FriendStatus)>,
    pub friends_request_send: Vec<Username>,
    pub friends_request_received: Vec<Username>,
}

impl Snapshot {
    pub fn status_of(&self, friend: &Username) -> Option<FriendStatus> {
        self.friends_list
            .iter()
            .find(|(name, _)| name == friend)
            .map(|(_, status)| *status)
    }
}

#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum ServerEvent {
    Renamed { from: Username, to: Username },
}

#[derive(Clone, Debug, Serialize, Deserialize, Eq, PartialEq)]
#[serde(untagged)]
pub enum ServerMessage {
    Snapshot(Snapshot),
    Event(ServerEvent),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn name(s: &str) -> Username {
        Username::parse(s).unwrap()
    }

    #[test]
    fn username_rules() {
        assert!(Username::parse("marvin_42.x-y").is_ok());
        assert!(Username::parse("").is_err());
        assert!(Username::parse("with space").is_err());
        assert!(Username::parse("semi;colon").is_err());
        assert!(Username::parse("a".repeat(63)).is_ok());
        assert!(Username::parse("a".repeat(64)).is_err());
    }

    #[test]
    fn username_deserialize_validates() {
        assert!(serde_json::from_str::<Username>("\"bob\"").is_ok());
        assert!(serde_json::from_str::<Username>("\"b o b\"").is_err());
    }

    #[test]
    fn status_ordering_and_wire_names() {
        assert!(FriendStatus::Connected < FriendStatus::Disconnected);
        assert!(FriendStatus::Disconnected < FriendStatus::InGame);
        assert_eq!(serde_json::to_string(&FriendStatus::InGame).unwrap(), "\"in-game\"");
        let legacy: FriendStatus = serde_json::from_str("\"in game\"").unwrap();
        assert_eq!(legacy, FriendStatus::InGame);
    }

    #[test]
    fn parse_commands() {
        assert_eq!(
            ClientCommand::parse(r#"["request_new_friend","bob"]"#).unwrap(),
            ClientCommand::RequestNewFriend("bob".into())
        );
        assert_eq!(
            ClientCommand::parse(r#"["update_username","bobby"]"#).unwrap(),
            ClientCommand::Rename("bobby".into())
        );
        assert_eq!(ClientCommand::parse(r#"["in game"]"#).unwrap(), ClientCommand::InGame);
        assert_eq!(ClientCommand::parse(r#"["game_done"]"#).unwrap(), ClientCommand::GameDone);
        assert_eq!(ClientCommand::parse(r#"["delete_user"]"#).unwrap(), ClientCommand::DeleteUser);
        assert_eq!(
            ClientCommand::parse(r#"["hello"]"#).unwrap(),
            ClientCommand::Other("hello".into())
        );
    }

    #[test]
    fn parse_rejects_malformed() {
        assert!(matches!(ClientCommand::parse("not json"), Err(ProtocolError::Malformed(_))));
        assert!(matches!(ClientCommand::parse("{}"), Err(ProtocolError::NotACommand)));
        assert!(matches!(ClientCommand::parse("[]"), Err(ProtocolError::NotACommand)));
        assert!(matches!(ClientCommand::parse("[1]"), Err(ProtocolError::NotACommand)));
        assert!(matches!(
            ClientCommand::parse(r#"["remove_friend"]"#),
            Err(ProtocolError::MissingArgument { verb: "remove_friend" })
        ));
        assert!(matches!(
            ClientCommand::parse(r#"["remove_friend", 3]"#),
            Err(ProtocolError::MissingArgument { .. })
        ));
    }

    #[test]
    fn encode_is_parsable() {
        let command = ClientCommand::AcceptFriendRequest("alice".into());
        assert_eq!(command.encode(), r#"["accept_friend_request","alice"]"#);
        assert_eq!(ClientCommand::parse(&command.encode()).unwrap(), command);
        assert_eq!(ClientCommand::InGame.encode(), r#"["in_game"]"#);
    }

    #[test]
    fn snapshot_wire_shape() {
        let snapshot = Snapshot {
            friends_list: vec![(name("bob"), FriendStatus::InGame)],
            friends_request_send: vec![name("carol")],
            friends_request_received: vec![],
        };
        let json = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(json["friends_list"], serde_json::json!([["bob", "in-game"]]));
        assert_eq!(json["friends_request_send"], serde_json::json!(["carol"]));
        assert_eq!(json["friends_request_received"], serde_json::json!([]));
    }

    #[test]
    fn server_message_decodes_both_shapes() {
        let snapshot: ServerMessage = serde_json::from_str(
            r#"{"friends_list":[],"friends_request_send":["a"],"friends_request_received":[]}"#,
        )
        .unwrap();
        assert!(matches!(snapshot, ServerMessage::Snapshot(_)));
        let event: ServerMessage =
            serde_json::from_str(r#"{"event":"renamed","from":"a","to":"b"}"#).unwrap();
        assert_eq!(
            event,
            ServerMessage::Event(ServerEvent::Renamed { from: name("a"), to: name("b") })
        );
    }

    #[test]
    fn websocket_url() {
        assert_eq!(Url("http://127.0.0.1:8000".into()).websocket().0, "ws://127.0.0.1:8000");
        assert_eq!(Url("https://host".into()).websocket().0, "wss://host");
        assert_eq!(Url("http://host/".into()).join("/add-user/x"), "http://host/add-user/x");
    }
}
