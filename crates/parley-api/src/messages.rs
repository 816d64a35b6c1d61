use std::collections::HashMap;

use axum::{
    Extension, Json,
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
};
use uuid::Uuid;

use parley_gateway::store::{message_from_row, parse_timestamp, parse_uuid};
use parley_types::api::{Claims, EditMessageRequest, MessageHistoryQuery, MessageResponse};
use parley_types::events::ServerEvent;
use parley_types::models::Reaction;

use crate::auth::{AppState, blocking};

/// Outcome of a blocking ownership check, mapped to a status code by the
/// handler.
enum Gate<T> {
    NotFound,
    Forbidden,
    Allowed(T),
}

/// Newest-first page of a chat's history with reaction sets attached.
/// Soft-deleted messages appear as tombstones so ordering stays stable.
pub async fn get_messages(
    State(state): State<AppState>,
    Path(chat_id): Path<Uuid>,
    Query(query): Query<MessageHistoryQuery>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let me = claims.sub.to_string();
    let cid = chat_id.to_string();
    let limit = query.limit.min(200);
    let before = query.before;

    let page = blocking(&state, move |db| {
        if !db.is_participant(&cid, &me)? {
            return Ok(None);
        }
        let rows = db.get_chat_messages(&cid, limit, before.as_deref())?;
        let message_ids: Vec<String> = rows.iter().map(|r| r.id.clone()).collect();
        let reaction_rows = db.reactions_for_messages(&message_ids)?;
        Ok(Some((rows, reaction_rows)))
    })
    .await?;

    let Some((rows, reaction_rows)) = page else {
        return Err(StatusCode::FORBIDDEN);
    };

    // Group reactions by message id (cheap in-memory work, fine on the
    // async thread)
    let mut reaction_map: HashMap<String, Vec<Reaction>> = HashMap::new();
    for r in reaction_rows {
        reaction_map
            .entry(r.message_id.clone())
            .or_default()
            .push(Reaction {
                user_id: parse_uuid(&r.user_id, "user_id"),
                emoji: r.emoji,
                timestamp: parse_timestamp(&r.created_at),
            });
    }

    let messages: Vec<MessageResponse> = rows
        .into_iter()
        .map(|row| {
            let reactions = reaction_map.remove(&row.id).unwrap_or_default();
            MessageResponse {
                message: message_from_row(row),
                reactions,
            }
        })
        .collect();

    Ok(Json(messages))
}

/// Replace a message's content. Sender only; the prior content is kept in
/// the edit history. The room is notified over the gateway.
pub async fn edit_message(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<EditMessageRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    if req.content.trim().is_empty() {
        return Err(StatusCode::BAD_REQUEST);
    }

    let me = claims.sub.to_string();
    let mid = message_id.to_string();

    let gate = blocking(&state, move |db| {
        let Some(row) = db.get_message(&mid)? else {
            return Ok(Gate::NotFound);
        };
        if row.is_deleted {
            return Ok(Gate::NotFound);
        }
        if row.sender_id != me {
            return Ok(Gate::Forbidden);
        }
        db.edit_message(&mid, &req.content)?;
        let updated = db
            .get_message(&mid)?
            .ok_or_else(|| anyhow::anyhow!("message vanished mid-edit: {}", mid))?;
        Ok(Gate::Allowed(updated))
    })
    .await?;

    let row = match gate {
        Gate::NotFound => return Err(StatusCode::NOT_FOUND),
        Gate::Forbidden => return Err(StatusCode::FORBIDDEN),
        Gate::Allowed(row) => row,
    };

    let message = message_from_row(row);
    let chat_id = message.chat_id;
    state
        .router
        .broadcast_room(
            chat_id,
            None,
            ServerEvent::MessageEdited {
                message: message.clone(),
                chat_id,
            },
        )
        .await;

    Ok(Json(MessageResponse {
        message,
        reactions: vec![],
    }))
}

/// Soft delete. Sender only; the row keeps its position as a tombstone and
/// the room is notified.
pub async fn delete_message(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let me = claims.sub.to_string();
    let mid = message_id.to_string();

    let gate = blocking(&state, move |db| {
        let Some(row) = db.get_message(&mid)? else {
            return Ok(Gate::NotFound);
        };
        if row.is_deleted {
            return Ok(Gate::NotFound);
        }
        if row.sender_id != me {
            return Ok(Gate::Forbidden);
        }
        db.soft_delete_message(&mid)?;
        Ok(Gate::Allowed(parse_uuid(&row.chat_id, "chat_id")))
    })
    .await?;

    let chat_id = match gate {
        Gate::NotFound => return Err(StatusCode::NOT_FOUND),
        Gate::Forbidden => return Err(StatusCode::FORBIDDEN),
        Gate::Allowed(chat_id) => chat_id,
    };

    state
        .router
        .broadcast_room(
            chat_id,
            None,
            ServerEvent::MessageDeleted {
                message_id,
                chat_id,
            },
        )
        .await;

    Ok(StatusCode::NO_CONTENT)
}

/// Pin a message in its chat. Any participant can pin.
pub async fn pin_message(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    set_pinned(state, message_id, claims, true).await
}

pub async fn unpin_message(
    State(state): State<AppState>,
    Path(message_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    set_pinned(state, message_id, claims, false).await
}

async fn set_pinned(
    state: AppState,
    message_id: Uuid,
    claims: Claims,
    pinned: bool,
) -> Result<StatusCode, StatusCode> {
    let me = claims.sub.to_string();
    let mid = message_id.to_string();

    let gate = blocking(&state, move |db| {
        let Some(row) = db.get_message(&mid)? else {
            return Ok(Gate::NotFound);
        };
        if row.is_deleted {
            return Ok(Gate::NotFound);
        }
        if !db.is_participant(&row.chat_id, &me)? {
            return Ok(Gate::Forbidden);
        }
        db.set_pinned(&mid, pinned, pinned.then_some(me.as_str()))?;
        Ok(Gate::Allowed(()))
    })
    .await?;

    match gate {
        Gate::NotFound => Err(StatusCode::NOT_FOUND),
        Gate::Forbidden => Err(StatusCode::FORBIDDEN),
        Gate::Allowed(()) => Ok(StatusCode::NO_CONTENT),
    }
}
