use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use axum::extract::ws::{Message, WebSocket};
use bytes::Bytes;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use tracing::{debug, error, info, trace, warn};
use uuid::Uuid;

use parley_core::Error;
use parley_types::events::{ClientEvent, ServerEvent};

use crate::Gateway;
use crate::dispatcher::{ConnId, Registration};

/// Heartbeat interval: server sends a Ping every 15 seconds.
/// If 2 consecutive Pongs are missed (~30s), the connection is dropped.
const HEARTBEAT_INTERVAL: Duration = Duration::from_secs(15);

/// Serve an authenticated socket until it closes. The access credential was
/// verified at the HTTP upgrade, so the identity is fixed for the lifetime of
/// the connection.
pub async fn handle_connection(socket: WebSocket, gateway: Gateway, user_id: Uuid, username: String) {
    let (mut sender, receiver) = socket.split();
    let dispatcher = gateway.dispatcher().clone();

    let Registration { conn_id, rx: conn_rx } = dispatcher.register(user_id).await;
    info!("{} ({}) connected to gateway", username, user_id);
    gateway.sync_presence(user_id).await;

    // Rooms mirror durable membership as of now.
    let rooms = match gateway.chat().conversation_ids_for_user(user_id).await {
        Ok(rooms) => rooms,
        Err(e) => {
            warn!("Could not load rooms for {}: {}", user_id, e);
            Vec::new()
        }
    };
    for room in &rooms {
        dispatcher.join(conn_id, *room).await;
    }

    let ready = ServerEvent::Ready {
        user_id,
        username: username.clone(),
        rooms,
    };
    let ready_sent = match encode(&ready) {
        Some(frame) => sender.send(frame).await.is_ok(),
        None => false,
    };

    if ready_sent {
        run_connection_loop(sender, receiver, gateway.clone(), conn_id, conn_rx, user_id, &username).await;
    }

    dispatcher.unregister(conn_id).await;
    gateway.sync_presence(user_id).await;
    info!("{} ({}) disconnected from gateway", username, user_id);
}

async fn run_connection_loop(
    mut sender: SplitSink<WebSocket, Message>,
    mut receiver: SplitStream<WebSocket>,
    gateway: Gateway,
    conn_id: ConnId,
    mut conn_rx: tokio::sync::mpsc::UnboundedReceiver<ServerEvent>,
    user_id: Uuid,
    username: &str,
) {
    let mut broadcast_rx = gateway.dispatcher().subscribe();

    let pong_received = Arc::new(AtomicBool::new(true));
    let pong_flag_send = pong_received.clone();
    let pong_flag_recv = pong_received.clone();

    // Forward global broadcasts + this connection's events -> client, with heartbeat
    let mut send_task = tokio::spawn(async move {
        let mut heartbeat = tokio::time::interval(HEARTBEAT_INTERVAL);
        heartbeat.tick().await;
        let mut missed_heartbeats: u8 = 0;

        loop {
            tokio::select! {
                result = broadcast_rx.recv() => {
                    let event = match result {
                        Ok(event) => event,
                        Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                            warn!("Broadcast receiver lagged by {} events", n);
                            continue;
                        }
                        Err(_) => break,
                    };
                    let Some(frame) = encode(&event) else { continue };
                    if sender.send(frame).await.is_err() {
                        break;
                    }
                }
                result = conn_rx.recv() => {
                    let Some(event) = result else { break };
                    let Some(frame) = encode(&event) else { continue };
                    if sender.send(frame).await.is_err() {
                        break;
                    }
                }
                _ = heartbeat.tick() => {
                    if pong_flag_send.swap(false, Ordering::Acquire) {
                        missed_heartbeats = 0;
                    } else {
                        missed_heartbeats += 1;
                        if missed_heartbeats >= 2 {
                            warn!("Heartbeat timeout (missed {} pongs), dropping connection", missed_heartbeats);
                            break;
                        }
                    }
                    if sender.send(Message::Ping(Bytes::new())).await.is_err() {
                        break;
                    }
                }
            }
        }
    });

    let username_recv = username.to_string();
    let mut recv_task = tokio::spawn(async move {
        while let Some(Ok(msg)) = receiver.next().await {
            match msg {
                Message::Text(text) => match serde_json::from_str::<ClientEvent>(&text) {
                    Ok(event) => {
                        trace!("{} ({}) -> {:?}", username_recv, user_id, event);
                        if let Err(e) = handle_event(&gateway, conn_id, user_id, event).await {
                            debug!("{} ({}) event failed: {}", username_recv, user_id, e);
                            gateway
                                .dispatcher()
                                .send_to_conn(conn_id, ServerEvent::error(client_message(&e)))
                                .await;
                        }
                    }
                    Err(e) => {
                        warn!(
                            "{} ({}) bad event: {} -- raw: {}",
                            username_recv,
                            user_id,
                            e,
                            text.chars().take(200).collect::<String>()
                        );
                        gateway
                            .dispatcher()
                            .send_to_conn(conn_id, ServerEvent::error("malformed event"))
                            .await;
                    }
                },
                Message::Pong(_) => {
                    pong_flag_recv.store(true, Ordering::Release);
                }
                Message::Close(_) => break,
                _ => {}
            }
        }
    });

    tokio::select! {
        _ = &mut send_task => recv_task.abort(),
        _ = &mut recv_task => send_task.abort(),
    }
}

pub(crate) async fn handle_event(
    gateway: &Gateway,
    conn_id: ConnId,
    user_id: Uuid,
    event: ClientEvent,
) -> parley_core::Result<()> {
    let dispatcher = gateway.dispatcher();
    match event {
        ClientEvent::RoomJoin(room) => {
            if !gateway.chat().is_member(room, user_id).await? {
                return Err(Error::Forbidden("not a member of this conversation".into()));
            }
            dispatcher.join(conn_id, room).await;
        }

        ClientEvent::RoomLeave(room) => dispatcher.leave(conn_id, room).await,

        ClientEvent::MessageSend(send) => {
            gateway
                .send_message(user_id, send.conversation_id, &send.content, send.kind, send.metadata)
                .await?;
        }

        ClientEvent::MessageRecall(notice) => {
            let message = gateway.chat().message(notice.message_id).await?;
            if message.conversation_id != notice.conversation_id {
                return Err(Error::NotFound("message"));
            }
            let recalled = gateway.chat().recall(message.id, user_id).await?;
            gateway.announce_recall(&recalled).await;
        }

        ClientEvent::TypingStart(room) => relay_typing(gateway, conn_id, user_id, room, true).await?,
        ClientEvent::TypingStop(room) => relay_typing(gateway, conn_id, user_id, room, false).await?,
    }
    Ok(())
}

async fn relay_typing(
    gateway: &Gateway,
    conn_id: ConnId,
    user_id: Uuid,
    room: Uuid,
    is_typing: bool,
) -> parley_core::Result<()> {
    let dispatcher = gateway.dispatcher();
    if !dispatcher.in_room(conn_id, room).await {
        return Err(Error::Forbidden("join the room first".into()));
    }
    dispatcher
        .send_to_room(
            room,
            ServerEvent::TypingStatus {
                conversation_id: room,
                user_id,
                is_typing,
            },
            Some(conn_id),
        )
        .await;
    Ok(())
}

/// Text sent back in a scoped `error` event. Internal details stay in the log.
fn client_message(e: &Error) -> String {
    match e {
        Error::Persistence(_) | Error::Internal(_) => {
            error!("Gateway event failed: {}", e);
            "internal error".to_string()
        }
        _ => e.to_string(),
    }
}

fn encode(event: &ServerEvent) -> Option<Message> {
    match serde_json::to_string(event) {
        Ok(text) => Some(Message::Text(text.into())),
        Err(e) => {
            error!("Failed to encode server event: {}", e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use chrono::Utc;

    use parley_core::capabilities::CapabilityGate;
    use parley_core::chat::ChatService;
    use parley_core::provider::UnconfiguredProvider;
    use parley_db::Database;
    use parley_db::models::NewUser;
    use parley_types::events::{RecallNotice, SendMessage};
    use parley_types::{MessageKind, Presence, Role};

    use super::*;
    use crate::assistant::Assistant;
    use crate::dispatcher::Dispatcher;

    struct Fixture {
        gateway: Gateway,
        db: Arc<Database>,
        alice: Uuid,
        bob: Uuid,
        eve: Uuid,
    }

    fn fixture() -> Fixture {
        let db = Arc::new(Database::open_in_memory().unwrap());
        let bot = db.ensure_bot_user(Utc::now()).unwrap().user_id().unwrap();
        let mut ids = Vec::new();
        for name in ["alice", "bob", "eve"] {
            ids.push(
                db.create_user(
                    &NewUser {
                        username: name,
                        email: &format!("{name}@example.com"),
                        password_hash: "hash",
                        display_name: name,
                        role: Role::User,
                    },
                    Utc::now(),
                )
                .unwrap()
                .user_id()
                .unwrap(),
            );
        }
        let chat = ChatService::new(db.clone(), CapabilityGate::new(db.clone()), Arc::new(UnconfiguredProvider));
        let dispatcher = Dispatcher::new();
        let assistant = Assistant::new(chat.clone(), dispatcher.clone(), bot, 5, Duration::from_secs(1));
        Fixture {
            gateway: Gateway::new(chat, dispatcher, assistant),
            db,
            alice: ids[0],
            bob: ids[1],
            eve: ids[2],
        }
    }

    fn drain(reg: &mut Registration) -> Vec<ServerEvent> {
        std::iter::from_fn(|| reg.rx.try_recv().ok()).collect()
    }

    #[tokio::test]
    async fn send_reaches_every_joined_member_including_sender() {
        let f = fixture();
        let (conv, _) = f.gateway.chat().open_private(f.alice, f.bob).await.unwrap();
        let d = f.gateway.dispatcher();
        let mut a = d.register(f.alice).await;
        let mut b = d.register(f.bob).await;
        handle_event(&f.gateway, a.conn_id, f.alice, ClientEvent::RoomJoin(conv.id)).await.unwrap();
        handle_event(&f.gateway, b.conn_id, f.bob, ClientEvent::RoomJoin(conv.id)).await.unwrap();

        let send = ClientEvent::MessageSend(SendMessage {
            conversation_id: conv.id,
            content: "hello".into(),
            kind: MessageKind::Text,
            metadata: None,
        });
        handle_event(&f.gateway, a.conn_id, f.alice, send).await.unwrap();

        let to_a = drain(&mut a);
        let to_b = drain(&mut b);
        let (ServerEvent::MessageNew(ma), ServerEvent::MessageNew(mb)) = (&to_a[0], &to_b[0]) else {
            panic!("expected message:new on both sockets");
        };
        assert_eq!(ma.id, mb.id);
        assert_eq!(ma.sender_id, f.alice);
    }

    #[tokio::test]
    async fn reconnect_during_disconnect_stays_online() {
        let f = fixture();
        let d = f.gateway.dispatcher();
        let stored_online = |id| f.db.get_user_by_id(id).unwrap().unwrap().is_online;

        let old = d.register(f.alice).await;
        f.gateway.sync_presence(f.alice).await;
        assert!(stored_online(f.alice));
        let mut watcher = d.subscribe();

        // old socket drops, a new one registers and syncs before the old
        // socket's own sync runs
        d.unregister(old.conn_id).await;
        let new = d.register(f.alice).await;
        f.gateway.sync_presence(f.alice).await;
        f.gateway.sync_presence(f.alice).await;
        assert!(stored_online(f.alice));
        assert!(watcher.try_recv().is_err());

        d.unregister(new.conn_id).await;
        f.gateway.sync_presence(f.alice).await;
        assert!(!stored_online(f.alice));
        assert_eq!(
            watcher.try_recv().unwrap(),
            ServerEvent::UserStatus { user_id: f.alice, status: Presence::Offline }
        );
    }

    #[tokio::test]
    async fn non_member_cannot_join_room() {
        let f = fixture();
        let (conv, _) = f.gateway.chat().open_private(f.alice, f.bob).await.unwrap();
        let eve = f.gateway.dispatcher().register(f.eve).await;
        let err = handle_event(&f.gateway, eve.conn_id, f.eve, ClientEvent::RoomJoin(conv.id))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));
        assert!(!f.gateway.dispatcher().in_room(eve.conn_id, conv.id).await);
    }

    #[tokio::test]
    async fn typing_skips_the_typist() {
        let f = fixture();
        let (conv, _) = f.gateway.chat().open_private(f.alice, f.bob).await.unwrap();
        let d = f.gateway.dispatcher();
        let mut a = d.register(f.alice).await;
        let mut b = d.register(f.bob).await;
        d.join(a.conn_id, conv.id).await;
        d.join(b.conn_id, conv.id).await;

        handle_event(&f.gateway, a.conn_id, f.alice, ClientEvent::TypingStart(conv.id)).await.unwrap();
        assert!(drain(&mut a).is_empty());
        assert_eq!(
            drain(&mut b),
            vec![ServerEvent::TypingStatus { conversation_id: conv.id, user_id: f.alice, is_typing: true }]
        );
    }

    #[tokio::test]
    async fn recall_over_socket_is_sender_only() {
        let f = fixture();
        let (conv, _) = f.gateway.chat().open_private(f.alice, f.bob).await.unwrap();
        let d = f.gateway.dispatcher();
        let mut b = d.register(f.bob).await;
        d.join(b.conn_id, conv.id).await;
        let msg = f.gateway.send_message(f.alice, conv.id, "oops", MessageKind::Text, None).await.unwrap();
        drain(&mut b);

        let notice = RecallNotice { conversation_id: conv.id, message_id: msg.id };
        let err = handle_event(&f.gateway, b.conn_id, f.bob, ClientEvent::MessageRecall(notice.clone()))
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Forbidden(_)));

        let a = d.register(f.alice).await;
        handle_event(&f.gateway, a.conn_id, f.alice, ClientEvent::MessageRecall(notice)).await.unwrap();
        assert_eq!(
            drain(&mut b),
            vec![ServerEvent::MessageRecalled { conversation_id: conv.id, message_id: msg.id }]
        );
    }

    /// Rooms are fixed at connect time: being added to a group later does not
    /// join an open socket unless the group creation is announced through
    /// the gateway or the client sends `room:join`.
    #[tokio::test]
    async fn membership_changes_are_not_pushed_without_announcement() {
        let f = fixture();
        let d = f.gateway.dispatcher();
        let bob = d.register(f.bob).await;

        let (group, members) = f
            .gateway
            .chat()
            .create_group(f.alice, "Quiet".into(), vec![f.bob])
            .await
            .unwrap();
        assert!(!d.in_room(bob.conn_id, group.id).await);

        f.gateway.announce_conversation(&group, &members).await;
        assert!(d.in_room(bob.conn_id, group.id).await);
    }

    #[tokio::test]
    async fn leaving_evicts_all_of_the_leavers_sockets() {
        let f = fixture();
        let d = f.gateway.dispatcher();
        let mut alice = d.register(f.alice).await;
        let bob = d.register(f.bob).await;
        let (group, members) = f
            .gateway
            .chat()
            .create_group(f.alice, "Team".into(), vec![f.bob])
            .await
            .unwrap();
        f.gateway.announce_conversation(&group, &members).await;
        drain(&mut alice);

        let outcome = f.gateway.chat().leave_group(group.id, f.bob).await.unwrap();
        f.gateway.member_left(group.id, f.bob, &outcome).await;

        assert!(!d.in_room(bob.conn_id, group.id).await);
        let events = drain(&mut alice);
        assert!(matches!(&events[0], ServerEvent::MessageNew(m) if m.kind == MessageKind::System));
    }
}
