use anyhow::{bail, Context};
use futures::{SinkExt, StreamExt};
use tether_common::{ClientCommand, ServerEvent, ServerMessage, Snapshot, Url, Username};
use tokio::net::TcpStream;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

/// HTTP helpers for the admin routes.
pub mod client {
    use anyhow::Result;
    use reqwest::Client;
    use tether_common::non_api_structs::Player;
    use tether_common::{Url, Username};

    pub async fn add_user(client: &Client, base: &Url, username: impl AsRef<Username>) -> Result<Player> {
        Ok(client
            .get(base.join(format!("/add-user/{}", username.as_ref())))
            .send()
            .await?
            .error_for_status()?
            .json::<_>()
            .await?)
    }
    pub async fn delete_user(client: &Client, base: &Url, username: impl AsRef<Username>) -> Result<()> {
        client
            .post(base.join(format!("/{}/private/post/delete", username.as_ref())))
            .send()
            .await?
            .error_for_status()?;
        Ok(())
    }
    pub async fn set_tournament_alias(
        client: &Client,
        base: &Url,
        username: impl AsRef<Username>,
        alias: Option<&str>,
    ) -> Result<Player> {
        Ok(client
            .post(base.join(format!("/{}/private/post/tournament-alias", username.as_ref())))
            .json(&alias)
            .send()
            .await?
            .error_for_status()?
            .json::<_>()
            .await?)
    }
    pub async fn get_friends(client: &Client, base: &Url, username: impl AsRef<Username>) -> Result<Vec<Username>> {
        get_list(client, base, username.as_ref(), "friends").await
    }
    pub async fn sent_friend_requests(
        client: &Client,
        base: &Url,
        username: impl AsRef<Username>,
    ) -> Result<Vec<Username>> {
        get_list(client, base, username.as_ref(), "sent-friend-requests").await
    }
    pub async fn rec_friend_requests(
        client: &Client,
        base: &Url,
        username: impl AsRef<Username>,
    ) -> Result<Vec<Username>> {
        get_list(client, base, username.as_ref(), "rec-friend-requests").await
    }

    async fn get_list(client: &Client, base: &Url, username: &Username, view: &str) -> Result<Vec<Username>> {
        Ok(client
            .get(base.join(format!("/{username}/private/get/{view}")))
            .send()
            .await?
            .error_for_status()?
            .json::<_>()
            .await?)
    }
}

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// A player's live friends connection.
pub struct FriendsSocket {
    stream: WsStream,
    username: Username,
}

impl FriendsSocket {
    pub async fn connect(base: &Url, username: impl AsRef<Username>) -> anyhow::Result<Self> {
        let username = username.as_ref().clone();
        let url = base.websocket().join(format!("/ws/friends/{username}"));
        let (stream, _) = connect_async(url.as_str())
            .await
            .with_context(|| format!("connecting as {username}"))?;
        Ok(Self { stream, username })
    }

    /// Current identity; follows renames seen on this socket.
    pub fn username(&self) -> &Username {
        &self.username
    }

    pub async fn send(&mut self, command: &ClientCommand) -> anyhow::Result<()> {
        self.stream.send(Message::Text(command.encode())).await?;
        Ok(())
    }

    pub async fn request_new_friend(&mut self, friend: impl AsRef<str>) -> anyhow::Result<()> {
        self.send(&ClientCommand::RequestNewFriend(friend.as_ref().to_string())).await
    }
    pub async fn remove_friend(&mut self, friend: impl AsRef<str>) -> anyhow::Result<()> {
        self.send(&ClientCommand::RemoveFriend(friend.as_ref().to_string())).await
    }
    pub async fn cancel_friend_request(&mut self, friend: impl AsRef<str>) -> anyhow::Result<()> {
        self.send(&ClientCommand::CancelFriendRequest(friend.as_ref().to_string())).await
    }
    pub async fn accept_friend_request(&mut self, friend: impl AsRef<str>) -> anyhow::Result<()> {
        self.send(&ClientCommand::AcceptFriendRequest(friend.as_ref().to_string())).await
    }
    pub async fn refuse_friend_request(&mut self, friend: impl AsRef<str>) -> anyhow::Result<()> {
        self.send(&ClientCommand::RefuseFriendRequest(friend.as_ref().to_string())).await
    }
    pub async fn rename(&mut self, new_username: impl AsRef<str>) -> anyhow::Result<()> {
        self.send(&ClientCommand::Rename(new_username.as_ref().to_string())).await
    }
    pub async fn delete_user(&mut self) -> anyhow::Result<()> {
        self.send(&ClientCommand::DeleteUser).await
    }
    pub async fn in_game(&mut self) -> anyhow::Result<()> {
        self.send(&ClientCommand::InGame).await
    }
    pub async fn game_done(&mut self) -> anyhow::Result<()> {
        self.send(&ClientCommand::GameDone).await
    }
    /// Asks for nothing but a fresh snapshot.
    pub async fn hello(&mut self) -> anyhow::Result<()> {
        self.send(&ClientCommand::Other(String::from("hello"))).await
    }

    pub async fn send_raw(&mut self, text: impl Into<String>) -> anyhow::Result<()> {
        self.stream.send(Message::Text(text.into())).await?;
        Ok(())
    }

    pub async fn next_message(&mut self) -> anyhow::Result<ServerMessage> {
        while let Some(message) = self.stream.next().await {
            match message? {
                Message::Text(text) => {
                    let message: ServerMessage = serde_json::from_str(&text)?;
                    if let ServerMessage::Event(ServerEvent::Renamed { from, to }) = &message {
                        if *from == self.username {
                            self.username = to.clone();
                        }
                    }
                    return Ok(message);
                }
                Message::Close(_) => break,
                _ => continue,
            }
        }
        bail!("connection of {} closed", self.username)
    }

    /// Skips events until the next snapshot.
    pub async fn next_snapshot(&mut self) -> anyhow::Result<Snapshot> {
        loop {
            if let ServerMessage::Snapshot(snapshot) = self.next_message().await? {
                return Ok(snapshot);
            }
        }
    }

    pub async fn close(mut self) -> anyhow::Result<()> {
        self.stream.close(None).await?;
        Ok(())
    }
}
