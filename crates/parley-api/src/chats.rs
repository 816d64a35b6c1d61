use axum::{
    Extension, Json,
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
};
use tracing::warn;
use uuid::Uuid;

use parley_gateway::store::{parse_timestamp, parse_uuid, status_from_str};
use parley_types::api::{
    AddParticipantRequest, ChatParticipant, ChatResponse, Claims, CreateGroupChatRequest,
    CreatePrivateChatRequest,
};
use parley_types::models::ChatKind;

use crate::auth::{AppState, blocking};

/// All chats the caller participates in, most recently active first.
pub async fn list_chats(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let user_id = claims.sub.to_string();
    let chats = blocking(&state, move |db| {
        let rows = db.chats_for_user(&user_id)?;
        let mut out = Vec::with_capacity(rows.len());
        for row in rows {
            let participants = db.get_participants(&row.id)?;
            out.push((row, participants));
        }
        Ok(out)
    })
    .await?;

    let chats: Vec<ChatResponse> = chats
        .into_iter()
        .map(|(row, participants)| chat_response(row, participants))
        .collect();

    Ok(Json(chats))
}

/// Create (or return the existing) one-on-one chat with another user.
pub async fn create_private_chat(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreatePrivateChatRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    if req.user_id == claims.sub {
        return Err(StatusCode::BAD_REQUEST);
    }

    let me = claims.sub.to_string();
    let peer = req.user_id.to_string();

    let (chat_id, created) = blocking(&state, move |db| {
        if db.get_user_by_id(&peer)?.is_none() {
            return Ok((None, false));
        }

        // Participant order is not canonical, so check both directions.
        if let Some(existing) = db
            .find_private_chat(&me, &peer)?
            .or(db.find_private_chat(&peer, &me)?)
        {
            return Ok((Some(existing), false));
        }

        let chat_id = Uuid::new_v4().to_string();
        db.create_chat(&chat_id, "private", None, None)?;
        db.add_participant(&chat_id, &me, "member")?;
        db.add_participant(&chat_id, &peer, "member")?;
        Ok((Some(chat_id), true))
    })
    .await?;

    let chat_id = chat_id.ok_or(StatusCode::NOT_FOUND)?;
    let status = if created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };

    let response = fetch_chat(&state, chat_id).await?;
    Ok((status, Json(response)))
}

/// Create a group chat owned by the caller.
pub async fn create_group_chat(
    State(state): State<AppState>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<CreateGroupChatRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    if req.name.trim().is_empty() || req.name.len() > 128 {
        return Err(StatusCode::BAD_REQUEST);
    }

    let owner = claims.sub.to_string();
    let chat_id = Uuid::new_v4().to_string();

    let cid = chat_id.clone();
    blocking(&state, move |db| {
        db.create_chat(&cid, "group", Some(req.name.trim()), Some(&owner))?;
        db.add_participant(&cid, &owner, "owner")?;
        for participant in &req.participant_ids {
            let id = participant.to_string();
            if id != owner && db.get_user_by_id(&id)?.is_some() {
                db.add_participant(&cid, &id, "member")?;
            }
        }
        Ok(())
    })
    .await?;

    let response = fetch_chat(&state, chat_id).await?;
    Ok((StatusCode::CREATED, Json(response)))
}

/// Add a user to a group chat. Admins and the owner only.
pub async fn add_participant(
    State(state): State<AppState>,
    Path(chat_id): Path<Uuid>,
    Extension(claims): Extension<Claims>,
    Json(req): Json<AddParticipantRequest>,
) -> Result<impl IntoResponse, StatusCode> {
    let me = claims.sub.to_string();
    let cid = chat_id.to_string();
    let target = req.user_id.to_string();

    let added = blocking(&state, move |db| {
        let Some(chat) = db.get_chat(&cid)? else {
            return Ok(None);
        };
        if chat.kind == "private" {
            return Ok(Some(false));
        }
        if !db.is_admin(&cid, &me)? {
            return Ok(Some(false));
        }
        if db.get_user_by_id(&target)?.is_none() {
            return Ok(None);
        }
        db.add_participant(&cid, &target, "member")?;
        Ok(Some(true))
    })
    .await?;

    match added {
        None => Err(StatusCode::NOT_FOUND),
        Some(false) => Err(StatusCode::FORBIDDEN),
        Some(true) => Ok(StatusCode::NO_CONTENT),
    }
}

/// Remove a participant. Admins can remove anyone; members can remove
/// themselves (leave).
pub async fn remove_participant(
    State(state): State<AppState>,
    Path((chat_id, user_id)): Path<(Uuid, Uuid)>,
    Extension(claims): Extension<Claims>,
) -> Result<impl IntoResponse, StatusCode> {
    let me = claims.sub.to_string();
    let cid = chat_id.to_string();
    let target = user_id.to_string();
    let leaving = user_id == claims.sub;

    let removed = blocking(&state, move |db| {
        if db.get_chat(&cid)?.is_none() || !db.is_participant(&cid, &target)? {
            return Ok(None);
        }
        if !leaving && !db.is_admin(&cid, &me)? {
            return Ok(Some(false));
        }
        db.remove_participant(&cid, &target)?;
        Ok(Some(true))
    })
    .await?;

    match removed {
        None => Err(StatusCode::NOT_FOUND),
        Some(false) => Err(StatusCode::FORBIDDEN),
        Some(true) => Ok(StatusCode::NO_CONTENT),
    }
}

async fn fetch_chat(state: &AppState, chat_id: String) -> Result<ChatResponse, StatusCode> {
    let (row, participants) = blocking(state, move |db| {
        let row = db.get_chat(&chat_id)?;
        match row {
            Some(row) => {
                let participants = db.get_participants(&row.id)?;
                Ok(Some((row, participants)))
            }
            None => Ok(None),
        }
    })
    .await?
    .ok_or(StatusCode::NOT_FOUND)?;

    Ok(chat_response(row, participants))
}

fn chat_response(
    row: parley_db::models::ChatRow,
    participants: Vec<parley_db::models::ParticipantRow>,
) -> ChatResponse {
    ChatResponse {
        id: parse_uuid(&row.id, "chat id"),
        kind: chat_kind_from_str(&row.kind),
        name: row.name,
        owner_id: row.owner_id.as_deref().map(|o| parse_uuid(o, "owner_id")),
        participants: participants
            .into_iter()
            .map(|p| ChatParticipant {
                user_id: parse_uuid(&p.user_id, "user_id"),
                username: p.username,
                role: p.role,
                status: status_from_str(&p.status),
                last_seen: parse_timestamp(&p.last_seen),
            })
            .collect(),
        created_at: parse_timestamp(&row.created_at),
    }
}

fn chat_kind_from_str(s: &str) -> ChatKind {
    match s {
        "private" => ChatKind::Private,
        "group" => ChatKind::Group,
        "channel" => ChatKind::Channel,
        other => {
            warn!("Unknown chat kind '{}', treating as private", other);
            ChatKind::Private
        }
    }
}
