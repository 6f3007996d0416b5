use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use axum::{
    extract::{
        ws::{Message as WsMessage, WebSocket},
        Query, State, WebSocketUpgrade,
    },
    http::{HeaderMap, StatusCode},
    response::Response,
};
use chrono::Utc;
use serde::Deserialize;
use tokio::sync::{broadcast, mpsc, RwLock, Semaphore};
use tokio::time::timeout;
use uuid::Uuid;

use parley_coord::CoordinationStore;
use parley_core::{
    ClientEvent, ErrorCode, FanoutFrame, Message, MessageStatus, PresenceStatus, ServerEvent,
    StatusUpdate,
};

use crate::auth::bearer_token;
use crate::service::{MessagingError, MessagingService};
use crate::AppState;

const SEND_TIMEOUT: Duration = Duration::from_secs(10);

/// Local view of who is connected to *this* instance: user to outbound
/// channel, plus logical room membership for conversation-scoped events.
/// Cross-instance lookup goes through the coordination store's presence
/// records; this map is only ever authoritative for local sockets.
pub struct ConnectionRegistry {
    instance_id: Uuid,
    connections: RwLock<HashMap<Uuid, ConnectionHandle>>,
    rooms: RwLock<HashMap<Uuid, HashSet<Uuid>>>,
}

struct ConnectionHandle {
    connection_id: Uuid,
    sender: mpsc::UnboundedSender<ServerEvent>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            instance_id: Uuid::new_v4(),
            connections: RwLock::new(HashMap::new()),
            rooms: RwLock::new(HashMap::new()),
        }
    }

    /// Handle written into the presence record: `{instance}/{connection}`.
    pub fn presence_handle(&self, connection_id: Uuid) -> String {
        format!("{}/{}", self.instance_id, connection_id)
    }

    /// Register a user's socket. A newer connection for the same user
    /// replaces the old handle; the old socket task notices when its
    /// unregister no longer matches.
    pub async fn register(&self, user_id: Uuid, sender: mpsc::UnboundedSender<ServerEvent>) -> Uuid {
        let connection_id = Uuid::new_v4();
        self.connections.write().await.insert(
            user_id,
            ConnectionHandle {
                connection_id,
                sender,
            },
        );
        connection_id
    }

    /// Drop the registration if it still belongs to `connection_id`.
    /// Returns false when a newer connection has already taken over, in
    /// which case presence must be left alone.
    pub async fn unregister(&self, user_id: Uuid, connection_id: Uuid) -> bool {
        let mut connections = self.connections.write().await;
        match connections.get(&user_id) {
            Some(handle) if handle.connection_id == connection_id => {
                connections.remove(&user_id);
                true
            }
            _ => false,
        }
    }

    pub async fn send_to(&self, user_id: Uuid, event: ServerEvent) -> bool {
        let connections = self.connections.read().await;
        match connections.get(&user_id) {
            Some(handle) => handle.sender.send(event).is_ok(),
            None => false,
        }
    }

    /// Idempotent room join.
    pub async fn join_room(&self, conversation_id: Uuid, user_id: Uuid) {
        self.rooms
            .write()
            .await
            .entry(conversation_id)
            .or_default()
            .insert(user_id);
    }

    pub async fn leave_room(&self, conversation_id: Uuid, user_id: Uuid) {
        let mut rooms = self.rooms.write().await;
        if let Some(members) = rooms.get_mut(&conversation_id) {
            members.remove(&user_id);
            if members.is_empty() {
                rooms.remove(&conversation_id);
            }
        }
    }

    pub async fn leave_all_rooms(&self, user_id: Uuid) {
        let mut rooms = self.rooms.write().await;
        rooms.retain(|_, members| {
            members.remove(&user_id);
            !members.is_empty()
        });
    }

    pub async fn room_members(&self, conversation_id: Uuid) -> Vec<Uuid> {
        let rooms = self.rooms.read().await;
        rooms
            .get(&conversation_id)
            .map(|members| members.iter().copied().collect())
            .unwrap_or_default()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

/// The connection gateway: accepts authenticated sockets, runs one actor per
/// connection, and routes fan-out frames to local sockets.
pub struct Gateway {
    service: MessagingService,
    coord: Arc<dyn CoordinationStore>,
    registry: Arc<ConnectionRegistry>,
    semaphore: Arc<Semaphore>,
}

impl Gateway {
    pub fn new(
        service: MessagingService,
        coord: Arc<dyn CoordinationStore>,
        max_connections: usize,
    ) -> Self {
        Self {
            service,
            coord,
            registry: Arc::new(ConnectionRegistry::new()),
            semaphore: Arc::new(Semaphore::new(max_connections)),
        }
    }

    #[cfg(test)]
    pub fn set_max_websocket_connections(&mut self, limit: usize) {
        self.semaphore = Arc::new(Semaphore::new(limit));
    }

    /// One pump per instance: subscribe to the shared fan-out stream and
    /// deliver each frame to whichever of its recipients are connected here.
    /// The publishing instance receives its own frames through the same
    /// path, so local and remote delivery are uniform.
    pub fn spawn_fanout_pump(&self) {
        let registry = self.registry.clone();
        let coord = self.coord.clone();
        let mut events = coord.subscribe();
        tokio::spawn(async move {
            loop {
                match events.recv().await {
                    Ok(frame) => route_frame(&registry, coord.as_ref(), frame).await,
                    Err(broadcast::error::RecvError::Lagged(skipped)) => {
                        tracing::warn!(skipped, "fan-out pump lagged; frames dropped");
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
        });
    }

    pub fn try_acquire_slot(&self) -> Option<tokio::sync::OwnedSemaphorePermit> {
        self.semaphore.clone().try_acquire_owned().ok()
    }

    /// Connection actor. By the time we are here the bearer token has been
    /// verified; the actor registers presence, replays the offline queue,
    /// announces the user online, then serves the event protocol until the
    /// socket closes.
    pub async fn run_socket(
        self: Arc<Self>,
        mut socket: WebSocket,
        user_id: Uuid,
        _permit: tokio::sync::OwnedSemaphorePermit,
    ) {
        let (tx, mut rx) = mpsc::unbounded_channel();
        let connection_id = self.registry.register(user_id, tx.clone()).await;
        let handle = self.registry.presence_handle(connection_id);

        if let Err(err) = self.coord.register_presence(user_id, &handle).await {
            tracing::warn!(?err, user_id = %user_id, "failed to register presence");
        }

        self.replay_offline_queue(user_id, &tx).await;
        self.announce_presence(user_id, PresenceStatus::Online).await;

        loop {
            tokio::select! {
                outbound = rx.recv() => {
                    match outbound {
                        Some(event) => {
                            let payload = serde_json::to_string(&event).unwrap_or_default();
                            let send = socket.send(WsMessage::Text(payload.into()));
                            match timeout(SEND_TIMEOUT, send).await {
                                Ok(Ok(())) => {}
                                Ok(Err(_)) => break,
                                Err(_) => {
                                    tracing::warn!(user_id = %user_id, "websocket send timeout");
                                    break;
                                }
                            }
                        }
                        None => break,
                    }
                }
                inbound = socket.recv() => {
                    match inbound {
                        Some(Ok(WsMessage::Text(text))) => {
                            self.handle_frame(user_id, text.as_str(), &tx).await;
                        }
                        Some(Ok(WsMessage::Ping(payload))) => {
                            if socket.send(WsMessage::Pong(payload)).await.is_err() {
                                break;
                            }
                        }
                        Some(Ok(WsMessage::Close(_))) | None => break,
                        Some(Ok(_)) => {}
                        Some(Err(err)) => {
                            tracing::debug!(?err, user_id = %user_id, "websocket receive error");
                            break;
                        }
                    }
                }
            }
        }

        // Only tear down shared state if no newer connection took over.
        if self.registry.unregister(user_id, connection_id).await {
            self.registry.leave_all_rooms(user_id).await;
            if let Err(err) = self.coord.clear_presence(user_id).await {
                tracing::warn!(?err, user_id = %user_id, "failed to clear presence");
            }
            self.announce_presence(user_id, PresenceStatus::Offline).await;
        }
    }

    async fn replay_offline_queue(&self, user_id: Uuid, tx: &mpsc::UnboundedSender<ServerEvent>) {
        let payloads = match self.coord.drain_offline(user_id).await {
            Ok(payloads) => payloads,
            Err(err) => {
                tracing::warn!(?err, user_id = %user_id, "failed to drain offline queue");
                return;
            }
        };
        if payloads.is_empty() {
            return;
        }
        let messages: Vec<Message> = payloads
            .iter()
            .filter_map(|payload| match serde_json::from_str(payload) {
                Ok(message) => Some(message),
                Err(err) => {
                    tracing::warn!(?err, "dropping undecodable offline payload");
                    None
                }
            })
            .collect();
        if messages.is_empty() {
            return;
        }
        tracing::info!(user_id = %user_id, count = messages.len(), "replaying offline messages");
        let _ = tx.send(ServerEvent::OfflineMessages(messages));
    }

    /// Tell the user's contacts they went online or offline. Contact
    /// resolution failures degrade to announcing to nobody.
    async fn announce_presence(&self, user_id: Uuid, status: PresenceStatus) {
        let recipients = match self.service.contacts(user_id).await {
            Ok(contacts) => contacts,
            Err(err) => {
                tracing::warn!(?err, user_id = %user_id, "failed to resolve contacts for presence broadcast");
                return;
            }
        };
        if recipients.is_empty() {
            return;
        }
        let frame = FanoutFrame::PresenceChanged {
            user_id,
            status,
            timestamp: Utc::now(),
            recipients,
        };
        if let Err(err) = self.coord.publish(&frame).await {
            tracing::warn!(?err, user_id = %user_id, "presence fan-out publish failed");
        }
    }

    /// Decode and dispatch one inbound frame. Failures are answered with an
    /// `error:message` event; nothing that happens in here closes the
    /// connection.
    async fn handle_frame(&self, user_id: Uuid, text: &str, tx: &mpsc::UnboundedSender<ServerEvent>) {
        // Any sign of life pushes the presence expiry out.
        if let Err(err) = self.coord.refresh_presence(user_id).await {
            tracing::debug!(?err, user_id = %user_id, "presence refresh failed");
        }

        let event = match serde_json::from_str::<ClientEvent>(text) {
            Ok(event) => event,
            Err(err) => {
                tracing::debug!(?err, user_id = %user_id, "unparseable client frame");
                let _ = tx.send(ServerEvent::error(
                    ErrorCode::InvalidPayload,
                    "unrecognized event payload",
                ));
                return;
            }
        };

        if let Err(err) = self.handle_event(user_id, event, tx).await {
            let _ = tx.send(error_event(&err));
        }
    }

    async fn handle_event(
        &self,
        user_id: Uuid,
        event: ClientEvent,
        tx: &mpsc::UnboundedSender<ServerEvent>,
    ) -> Result<(), MessagingError> {
        match event {
            ClientEvent::MessageSend {
                receiver_id,
                content,
                attachments,
            } => {
                // Admission control first; a rejected send is dropped, never
                // queued, and the sender must retry on their own.
                self.service.check_send_allowed(user_id).await?;
                let message = self
                    .service
                    .send_message(user_id, receiver_id, &content, &attachments)
                    .await?;

                let _ = tx.send(ServerEvent::MessageStatus(StatusUpdate {
                    message_ids: vec![message.message_id],
                    status: MessageStatus::Sent,
                    timestamp: message.created_at,
                    read_by: None,
                }));

                // Live delivery rides the fan-out channel. If nobody holds a
                // presence record for the receiver, park the payload for
                // their next connect.
                let receiver_online = self.coord.is_online(receiver_id).await.unwrap_or(false);
                if !receiver_online {
                    match serde_json::to_string(&message) {
                        Ok(payload) => {
                            if let Err(err) = self.coord.queue_offline(receiver_id, &payload).await {
                                tracing::warn!(?err, receiver_id = %receiver_id, "failed to queue offline message");
                            }
                        }
                        Err(err) => {
                            tracing::warn!(?err, "failed to serialize message for offline queue");
                        }
                    }
                }
                Ok(())
            }
            ClientEvent::MessageDelivered { message_id } => {
                self.service.mark_delivered(message_id, user_id).await?;
                Ok(())
            }
            ClientEvent::MessageRead {
                message_ids,
                conversation_id,
            } => {
                self.service
                    .mark_read(&message_ids, conversation_id, user_id)
                    .await?;
                Ok(())
            }
            ClientEvent::TypingStart {
                conversation_id,
                receiver_id,
            } => {
                self.forward_typing(conversation_id, user_id, receiver_id, true)
                    .await;
                Ok(())
            }
            ClientEvent::TypingStop {
                conversation_id,
                receiver_id,
            } => {
                self.forward_typing(conversation_id, user_id, receiver_id, false)
                    .await;
                Ok(())
            }
            ClientEvent::ConversationJoin { conversation_id } => {
                if !self.service.is_participant(conversation_id, user_id).await? {
                    return Err(MessagingError::Forbidden);
                }
                self.registry.join_room(conversation_id, user_id).await;
                Ok(())
            }
            ClientEvent::ConversationLeave { conversation_id } => {
                self.registry.leave_room(conversation_id, user_id).await;
                Ok(())
            }
        }
    }

    /// Typing is advisory: the marker self-expires, and every failure here
    /// only costs an indicator, so nothing propagates.
    async fn forward_typing(
        &self,
        conversation_id: Uuid,
        user_id: Uuid,
        receiver_id: Uuid,
        is_typing: bool,
    ) {
        let marker = if is_typing {
            self.coord.set_typing(conversation_id, user_id).await
        } else {
            self.coord.clear_typing(conversation_id, user_id).await
        };
        if let Err(err) = marker {
            tracing::debug!(?err, conversation_id = %conversation_id, "typing marker update failed");
        }

        let frame = FanoutFrame::Typing {
            conversation_id,
            user_id,
            recipient: receiver_id,
            is_typing,
        };
        if let Err(err) = self.coord.publish(&frame).await {
            tracing::debug!(?err, conversation_id = %conversation_id, "typing fan-out publish failed");
        }
    }
}

async fn route_frame(
    registry: &ConnectionRegistry,
    coord: &dyn CoordinationStore,
    frame: FanoutFrame,
) {
    match frame {
        FanoutFrame::NewMessage { message } => {
            let receiver_id = message.receiver_id;
            let conversation_id = message.conversation_id;
            let delivered = registry
                .send_to(receiver_id, ServerEvent::MessageReceive(message))
                .await;
            if delivered {
                if let Err(err) = coord.increment_unread(receiver_id, conversation_id).await {
                    tracing::warn!(?err, receiver_id = %receiver_id, "failed to bump unread badge");
                }
            }
        }
        FanoutFrame::StatusChanged { recipient, update } => {
            registry
                .send_to(recipient, ServerEvent::MessageStatus(update))
                .await;
        }
        FanoutFrame::Typing {
            conversation_id,
            user_id,
            recipient,
            is_typing,
        } => {
            let event = ServerEvent::TypingIndicator {
                conversation_id,
                user_id,
                is_typing,
            };
            // Scoped to the conversation's room, plus the named recipient for
            // clients that have not joined the room yet.
            let mut delivered = HashSet::new();
            for member in registry.room_members(conversation_id).await {
                if member != user_id && delivered.insert(member) {
                    registry.send_to(member, event.clone()).await;
                }
            }
            if recipient != user_id && delivered.insert(recipient) {
                registry.send_to(recipient, event).await;
            }
        }
        FanoutFrame::PresenceChanged {
            user_id,
            status,
            timestamp,
            recipients,
        } => {
            for recipient in recipients {
                registry
                    .send_to(
                        recipient,
                        ServerEvent::UserStatus {
                            user_id,
                            status,
                            timestamp,
                        },
                    )
                    .await;
            }
        }
    }
}

fn error_event(err: &MessagingError) -> ServerEvent {
    match err {
        MessagingError::Forbidden => ServerEvent::error(
            ErrorCode::Forbidden,
            "you can only message users who follow you back",
        ),
        MessagingError::NotFound => ServerEvent::error(ErrorCode::NotFound, "resource not found"),
        MessagingError::RateLimited => ServerEvent::error(
            ErrorCode::RateLimited,
            "rate limit exceeded; the message was not sent",
        ),
        MessagingError::EmptyContent | MessagingError::ContentTooLarge => {
            ServerEvent::error(ErrorCode::InvalidPayload, err.to_string())
        }
        MessagingError::Storage(err) => {
            tracing::error!(?err, "event handling failed");
            ServerEvent::error(ErrorCode::InternalError, "failed to process event")
        }
    }
}

#[derive(Debug, Deserialize)]
pub struct SocketQuery {
    token: Option<String>,
}

/// `GET /messaging/ws`: authenticate the bearer credential, then upgrade.
/// Rejections happen before the upgrade so unauthenticated clients see a
/// plain HTTP status, not a short-lived socket.
pub async fn messaging_socket(
    State(state): State<AppState>,
    headers: HeaderMap,
    Query(query): Query<SocketQuery>,
    ws: WebSocketUpgrade,
) -> Result<Response, StatusCode> {
    #[cfg(feature = "metrics")]
    let route = "messaging.ws";

    let Some(token) = bearer_token(&headers, query.token.as_deref()) else {
        let status = StatusCode::UNAUTHORIZED;
        #[cfg(feature = "metrics")]
        state.record_http_request(route, status.as_u16());
        return Err(status);
    };
    let claims = match state.verifier().verify(&token) {
        Ok(claims) => claims,
        Err(err) => {
            tracing::debug!(?err, "websocket token rejected");
            let status = StatusCode::UNAUTHORIZED;
            #[cfg(feature = "metrics")]
            state.record_http_request(route, status.as_u16());
            return Err(status);
        }
    };

    let gateway = state.gateway();
    let Some(permit) = gateway.try_acquire_slot() else {
        let status = StatusCode::TOO_MANY_REQUESTS;
        #[cfg(feature = "metrics")]
        state.record_http_request(route, status.as_u16());
        return Err(status);
    };

    #[cfg(feature = "metrics")]
    state.record_http_request(route, StatusCode::SWITCHING_PROTOCOLS.as_u16());

    Ok(ws.on_upgrade(move |socket| gateway.run_socket(socket, claims.user_id, permit)))
}
