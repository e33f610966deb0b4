pub mod accounts;
pub mod config;
pub mod connection;
pub mod error;
pub mod http;
pub mod players;
pub mod registry;
pub mod router;
pub mod session;
pub mod snapshot;
pub mod store;

use std::net::SocketAddr;
use std::sync::Arc;

use axum::routing::{get, post};
use axum::Extension;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::config::ServerConfig;
use crate::players::Players;
use crate::registry::PresenceRegistry;
use crate::router::EventRouter;
use crate::store::RelationshipStore;

#[derive(Clone)]
pub struct State {
    pub players: Arc<Players>,
    pub store: Arc<RelationshipStore>,
    pub router: Arc<EventRouter>,
}

impl State {
    pub fn new(db: &sled::Db, outbound_capacity: usize) -> anyhow::Result<Self> {
        let players = Arc::new(Players::open(db)?);
        let store = Arc::new(RelationshipStore::open(db)?);
        let router = EventRouter::new(
            Arc::clone(&store),
            players.clone(),
            Arc::new(PresenceRegistry::new()),
            outbound_capacity,
        );
        Ok(Self {
            players,
            store,
            router: Arc::new(router),
        })
    }
}

pub fn app(state: State) -> axum::Router {
    axum::Router::new()
        .route("/", get(http::root))
        .route("/add-user/:username", get(http::add_user))
        .route("/:username/private/get/friends", get(http::get_friends))
        .route("/:username/private/get/sent-friend-requests", get(http::get_sent_friend_requests))
        .route("/:username/private/get/rec-friend-requests", get(http::get_rec_friend_requests))
        .route("/:username/private/post/tournament-alias", post(http::post_tournament_alias))
        .route("/:username/private/post/delete", post(http::post_delete))
        .route("/ws/friends/:username", get(connection::upgrade))
        .route("/ws/friends/:username/", get(connection::upgrade))
        .layer(Extension(state))
}

/// A server started by [`serve`].
pub struct Running {
    pub addr: SocketAddr,
    pub handle: JoinHandle<anyhow::Result<()>>,
    /// Cancel to stop accepting and let the server task finish.
    pub shutdown: CancellationToken,
}

pub async fn serve(config: &ServerConfig) -> anyhow::Result<Running> {
    let db = config.open_db()?;
    let state = State::new(&db, config.outbound_capacity)?;
    let server = axum::Server::try_bind(&config.addr())?.serve(app(state).into_make_service());
    let addr = server.local_addr();
    let shutdown = CancellationToken::new();
    let stop = shutdown.clone();
    let handle = tokio::spawn(async move {
        server
            .with_graceful_shutdown(async move { stop.cancelled().await })
            .await?;
        db.flush_async().await?;
        info!("server stopped");
        Ok(())
    });
    info!(%addr, "listening");
    Ok(Running { addr, handle, shutdown })
}
