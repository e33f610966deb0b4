use axum::extract::Path;
use axum::response::IntoResponse;
use axum::{Extension, Json};
use tether_common::Username;
use tracing::info;

use crate::error::{AppError, Result};
use crate::players::PlayerDirectory;
use crate::State;

pub async fn root() -> &'static str {
    "tether is running"
}

pub async fn add_user(Extension(state): Extension<State>, Path(username): Path<String>) -> Result<impl IntoResponse> {
    let player = state.players.create_player(Username::parse(username)?)?;
    info!(username = %player.username, "player created");
    Ok(serde_json::to_string(&player)?)
}

pub async fn get_friends(Extension(state): Extension<State>, Path(username): Path<String>) -> Result<impl IntoResponse> {
    let username = known(&state, &username)?;
    Ok(serde_json::to_string(&state.store.friends_of(&username)?)?)
}

pub async fn get_sent_friend_requests(
    Extension(state): Extension<State>,
    Path(username): Path<String>,
) -> Result<impl IntoResponse> {
    let username = known(&state, &username)?;
    Ok(serde_json::to_string(&state.store.pending_sent(&username)?)?)
}

pub async fn get_rec_friend_requests(
    Extension(state): Extension<State>,
    Path(username): Path<String>,
) -> Result<impl IntoResponse> {
    let username = known(&state, &username)?;
    Ok(serde_json::to_string(&state.store.pending_received(&username)?)?)
}

pub async fn post_tournament_alias(
    Extension(state): Extension<State>,
    Path(username): Path<String>,
    Json(alias): Json<Option<String>>,
) -> Result<impl IntoResponse> {
    let username = known(&state, &username)?;
    let player = state.players.set_tournament_alias(&username, alias)?;
    Ok(serde_json::to_string(&player)?)
}

/// Account deletion coming from outside the websocket, e.g. an admin tool.
pub async fn post_delete(Extension(state): Extension<State>, Path(username): Path<String>) -> Result<impl IntoResponse> {
    let username = Username::parse(&username)?;
    if !state.router.on_player_deleted(&username)? {
        return Err(AppError::unknown_player(username));
    }
    Ok(())
}

fn known(state: &State, username: &str) -> Result<Username> {
    let username = Username::parse(username)?;
    if !state.players.player_exists(&username)? {
        return Err(AppError::unknown_player(username));
    }
    Ok(username)
}
