use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use parley_core::{AttachmentDescriptor, Conversation, Message};

use crate::auth::bearer_token;
use crate::service::{ConversationSummary, HistoryPage, MessagingError};
use crate::AppState;

#[derive(Debug, Serialize)]
struct ErrorBody<'a> {
    error: &'a str,
}

impl<'a> ErrorBody<'a> {
    fn simple(error: &'a str) -> Self {
        Self { error }
    }
}

fn record(state: &AppState, route: &'static str, status: StatusCode) {
    #[cfg(feature = "metrics")]
    state.record_http_request(route, status.as_u16());
    #[cfg(not(feature = "metrics"))]
    {
        let _ = (state, route, status);
    }
}

/// Resolve the caller from the Authorization header. Every messaging route
/// requires it; connection-time auth is the gateway's version of the same
/// check.
fn authenticate(state: &AppState, headers: &HeaderMap) -> Result<Uuid, Response> {
    let Some(token) = bearer_token(headers, None) else {
        return Err((
            StatusCode::UNAUTHORIZED,
            Json(ErrorBody::simple("missing_bearer_token")),
        )
            .into_response());
    };
    match state.verifier().verify(&token) {
        Ok(claims) => Ok(claims.user_id),
        Err(err) => {
            tracing::debug!(?err, "bearer token rejected");
            Err((
                StatusCode::UNAUTHORIZED,
                Json(ErrorBody::simple("invalid_token")),
            )
                .into_response())
        }
    }
}

fn error_status(err: &MessagingError) -> (StatusCode, &'static str) {
    match err {
        MessagingError::Forbidden => (StatusCode::FORBIDDEN, "forbidden"),
        MessagingError::NotFound => (StatusCode::NOT_FOUND, "not_found"),
        MessagingError::RateLimited => (StatusCode::TOO_MANY_REQUESTS, "rate_limited"),
        MessagingError::EmptyContent => (StatusCode::BAD_REQUEST, "empty_content"),
        MessagingError::ContentTooLarge => (StatusCode::BAD_REQUEST, "content_too_large"),
        MessagingError::Storage(_) => (StatusCode::INTERNAL_SERVER_ERROR, "server_error"),
    }
}

fn error_response(state: &AppState, route: &'static str, err: MessagingError) -> Response {
    if let MessagingError::Storage(inner) = &err {
        tracing::error!(?inner, route, "request failed");
    }
    let (status, label) = error_status(&err);
    record(state, route, status);
    (status, Json(ErrorBody::simple(label))).into_response()
}

#[derive(Debug, Deserialize)]
pub struct PageQuery {
    pub page: Option<i64>,
    pub page_size: Option<i64>,
}

#[derive(Debug, Deserialize)]
pub struct CreateConversationRequest {
    pub participant_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct SendMessageRequest {
    pub receiver_id: Uuid,
    pub content: String,
    #[serde(default)]
    pub attachments: Vec<AttachmentDescriptor>,
}

#[derive(Debug, Deserialize)]
pub struct MarkReadRequest {
    pub message_ids: Vec<Uuid>,
    pub conversation_id: Uuid,
}

#[derive(Debug, Deserialize)]
pub struct SearchQuery {
    pub q: String,
}

#[derive(Debug, Serialize)]
struct CanMessageResponse {
    can_message: bool,
}

#[derive(Debug, Serialize)]
struct UnreadCountResponse {
    count: i64,
}

#[derive(Debug, Serialize)]
struct MarkReadResponse {
    success: bool,
    updated: Vec<Uuid>,
}

/// `GET /messaging/conversations` — newest-activity-first listing.
pub async fn list_conversations(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(page): Query<PageQuery>,
) -> Response {
    let route = "messaging.conversations.list";
    let user_id = match authenticate(&state, &headers) {
        Ok(user_id) => user_id,
        Err(response) => {
            record(&state, route, StatusCode::UNAUTHORIZED);
            return response;
        }
    };

    match state
        .service()
        .conversations(user_id, page.page.unwrap_or(1), page.page_size.unwrap_or(20))
        .await
    {
        Ok(summaries) => {
            record(&state, route, StatusCode::OK);
            Json::<Vec<ConversationSummary>>(summaries).into_response()
        }
        Err(err) => error_response(&state, route, err),
    }
}

/// `POST /messaging/conversations` — create-or-fetch, gated on mutual follow.
pub async fn create_conversation(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<CreateConversationRequest>,
) -> Response {
    let route = "messaging.conversations.create";
    let user_id = match authenticate(&state, &headers) {
        Ok(user_id) => user_id,
        Err(response) => {
            record(&state, route, StatusCode::UNAUTHORIZED);
            return response;
        }
    };

    match state
        .service()
        .get_or_create_conversation(user_id, body.participant_id)
        .await
    {
        Ok(conversation) => {
            record(&state, route, StatusCode::OK);
            Json::<Conversation>(conversation).into_response()
        }
        Err(err) => error_response(&state, route, err),
    }
}

/// `GET /messaging/conversations/{id}/messages` — paginated history,
/// cache-first with a durable fallback.
pub async fn chat_history(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(conversation_id): Path<Uuid>,
    Query(page): Query<PageQuery>,
) -> Response {
    let route = "messaging.history";
    let user_id = match authenticate(&state, &headers) {
        Ok(user_id) => user_id,
        Err(response) => {
            record(&state, route, StatusCode::UNAUTHORIZED);
            return response;
        }
    };

    match state
        .service()
        .chat_history(
            conversation_id,
            user_id,
            page.page.unwrap_or(1),
            page.page_size.unwrap_or(50),
        )
        .await
    {
        Ok(history) => {
            record(&state, route, StatusCode::OK);
            Json::<HistoryPage>(history).into_response()
        }
        Err(err) => error_response(&state, route, err),
    }
}

/// `POST /messaging/send` — HTTP fallback mirroring the socket send path,
/// including the rate limit.
pub async fn send_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<SendMessageRequest>,
) -> Response {
    let route = "messaging.send";
    let user_id = match authenticate(&state, &headers) {
        Ok(user_id) => user_id,
        Err(response) => {
            record(&state, route, StatusCode::UNAUTHORIZED);
            return response;
        }
    };

    if let Err(err) = state.service().check_send_allowed(user_id).await {
        return error_response(&state, route, err);
    }

    match state
        .service()
        .send_message(user_id, body.receiver_id, &body.content, &body.attachments)
        .await
    {
        Ok(message) => {
            record(&state, route, StatusCode::CREATED);
            (StatusCode::CREATED, Json::<Message>(message)).into_response()
        }
        Err(err) => error_response(&state, route, err),
    }
}

/// `POST /messaging/mark-read` — bulk read acknowledgement.
pub async fn mark_read(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(body): Json<MarkReadRequest>,
) -> Response {
    let route = "messaging.mark_read";
    let user_id = match authenticate(&state, &headers) {
        Ok(user_id) => user_id,
        Err(response) => {
            record(&state, route, StatusCode::UNAUTHORIZED);
            return response;
        }
    };

    match state
        .service()
        .mark_read(&body.message_ids, body.conversation_id, user_id)
        .await
    {
        Ok(update) => {
            record(&state, route, StatusCode::OK);
            Json(MarkReadResponse {
                success: true,
                updated: update.map(|update| update.message_ids).unwrap_or_default(),
            })
            .into_response()
        }
        Err(err) => error_response(&state, route, err),
    }
}

/// `GET /messaging/conversations/{id}/search?q=` — substring search.
pub async fn search_messages(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(conversation_id): Path<Uuid>,
    Query(query): Query<SearchQuery>,
) -> Response {
    let route = "messaging.search";
    let user_id = match authenticate(&state, &headers) {
        Ok(user_id) => user_id,
        Err(response) => {
            record(&state, route, StatusCode::UNAUTHORIZED);
            return response;
        }
    };

    match state
        .service()
        .search_messages(conversation_id, user_id, &query.q)
        .await
    {
        Ok(messages) => {
            record(&state, route, StatusCode::OK);
            Json::<Vec<Message>>(messages).into_response()
        }
        Err(err) => error_response(&state, route, err),
    }
}

/// `GET /messaging/can-message/{user_id}` — mutual-follow probe.
pub async fn can_message(
    State(state): State<AppState>,
    headers: HeaderMap,
    Path(other_id): Path<Uuid>,
) -> Response {
    let route = "messaging.can_message";
    let user_id = match authenticate(&state, &headers) {
        Ok(user_id) => user_id,
        Err(response) => {
            record(&state, route, StatusCode::UNAUTHORIZED);
            return response;
        }
    };

    match state.service().can_message(user_id, other_id).await {
        Ok(allowed) => {
            record(&state, route, StatusCode::OK);
            Json(CanMessageResponse {
                can_message: allowed,
            })
            .into_response()
        }
        Err(err) => error_response(&state, route, err),
    }
}

/// `GET /messaging/contacts` — mutual follows.
pub async fn contacts(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let route = "messaging.contacts";
    let user_id = match authenticate(&state, &headers) {
        Ok(user_id) => user_id,
        Err(response) => {
            record(&state, route, StatusCode::UNAUTHORIZED);
            return response;
        }
    };

    match state.service().contacts(user_id).await {
        Ok(contacts) => {
            record(&state, route, StatusCode::OK);
            Json::<Vec<Uuid>>(contacts).into_response()
        }
        Err(err) => error_response(&state, route, err),
    }
}

/// `GET /messaging/unread-count` — durable unread aggregate.
pub async fn unread_count(State(state): State<AppState>, headers: HeaderMap) -> Response {
    let route = "messaging.unread_count";
    let user_id = match authenticate(&state, &headers) {
        Ok(user_id) => user_id,
        Err(response) => {
            record(&state, route, StatusCode::UNAUTHORIZED);
            return response;
        }
    };

    match state.service().unread_count(user_id).await {
        Ok(count) => {
            record(&state, route, StatusCode::OK);
            Json(UnreadCountResponse { count }).into_response()
        }
        Err(err) => error_response(&state, route, err),
    }
}
