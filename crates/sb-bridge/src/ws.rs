use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket, WebSocketUpgrade};
use axum::extract::State;
use axum::response::IntoResponse;
use futures_util::{SinkExt, StreamExt};
use sb_agents::ChatRequest;
use sb_core::types::{ClientId, ErrorCode, InterruptReason, ThreadId};
use sb_relay::{AudioFrame, Route, TtsOutput};
use tracing::{debug, info, warn};

use crate::protocol::{
    ChatPayload, ClientMessage, JoinSttPayload, JoinTtsPayload, LeaveSttPayload, LeaveTtsPayload,
    ServerMessage,
};
use crate::session::{Outgoing, Session};
use crate::state::AppState;

/// GET /ws: upgrade to a client session.
pub async fn ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<Arc<AppState>>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

async fn handle_socket(socket: WebSocket, state: Arc<AppState>) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (update_tx, update_rx) = flume::unbounded();
    let (out_tx, out_rx) = flume::unbounded();
    let session = Arc::new(Session::new(update_tx, out_tx));
    state.sessions.insert(Arc::clone(&session));
    info!(connection = %session.id, "client connected");

    // Task: session channels -> socket
    let writer = tokio::spawn(async move {
        loop {
            let message = tokio::select! {
                update = update_rx.recv_async() => match update {
                    Ok(update) => text_frame(&ServerMessage::from(update)),
                    Err(_) => break,
                },
                outgoing = out_rx.recv_async() => match outgoing {
                    Ok(Outgoing::Message(msg)) => text_frame(&msg),
                    Ok(Outgoing::Audio(frame)) => Some(Message::Binary(frame.into())),
                    Err(_) => break,
                },
            };
            let Some(message) = message else { continue };
            if ws_tx.send(message).await.is_err() {
                break;
            }
        }
    });

    // Socket -> session
    while let Some(frame) = ws_rx.next().await {
        match frame {
            Ok(Message::Text(text)) => handle_text(&state, &session, text.as_str()).await,
            Ok(Message::Binary(data)) => handle_audio(&state, &session, &data).await,
            Ok(Message::Close(_)) | Err(_) => break,
            Ok(_) => {}
        }
    }

    close_session(&state, &session).await;
    writer.abort();
}

fn text_frame(message: &ServerMessage) -> Option<Message> {
    match serde_json::to_string(message) {
        Ok(json) => Some(Message::Text(json.into())),
        Err(e) => {
            warn!(error = %e, "failed to encode server message");
            None
        }
    }
}

/// Interrupt the connection's run and release every relay subscription it
/// holds.
async fn close_session(state: &AppState, session: &Session) {
    session.slot.interrupt(InterruptReason::Client);
    let stt_routes = state.stt.unsubscribe_owner(session.id).await;
    let tts_clients = state.tts.leave_owner(session.id).await;
    state.sessions.remove(&session.id);
    info!(
        connection = %session.id,
        stt_routes = stt_routes.len(),
        tts_clients = tts_clients.len(),
        "client disconnected"
    );
}

async fn handle_text(state: &Arc<AppState>, session: &Arc<Session>, text: &str) {
    let message = match ClientMessage::parse(text) {
        Ok(message) => message,
        Err(e) => {
            debug!(connection = %session.id, error = %e, "bad client message");
            session.send(ServerMessage::error(ErrorCode::BadRequest, e.to_string()));
            return;
        }
    };
    match message {
        ClientMessage::Chat(chat) => handle_chat(state, session, chat),
        ClientMessage::Interrupt => interrupt(state, session).await,
        ClientMessage::JoinStt(join) => join_stt(state, session, join).await,
        ClientMessage::LeaveStt(leave) => leave_stt(state, session, leave).await,
        ClientMessage::JoinTts(join) => join_tts(state, session, join).await,
        ClientMessage::LeaveTts(leave) => leave_tts(state, session, leave).await,
    }
}

/// Stop the active run, if any, and flush synthesized audio still queued
/// for the connection. Audio from a run that already finished is flushed
/// too.
async fn interrupt(state: &AppState, session: &Session) {
    if let Some(run_id) = session.slot.interrupt(InterruptReason::Client) {
        debug!(connection = %session.id, run_id = %run_id, "client interrupt");
    }
    if let Some(client) = session.tts_client() {
        if let Err(e) = state.tts.stop(&client).await {
            debug!(client_id = %client, error = %e, "tts stop on interrupt failed");
        }
    }
}

fn handle_chat(state: &AppState, session: &Session, chat: ChatPayload) {
    let request = ChatRequest {
        agent: chat.agent,
        text: chat.text,
        thread_id: chat.thread_id.map(ThreadId::from),
    };
    // Rejections are reported on the session's update channel.
    let _ = state.orchestrator.submit(session.run_target(), request);
}

async fn join_stt(state: &AppState, session: &Session, join: JoinSttPayload) {
    let client_id = ClientId::from(join.client_id.trim());
    if client_id.as_str().is_empty() {
        session.send(ServerMessage::error(ErrorCode::BadRequest, "clientId is empty"));
        return;
    }
    let Some(preset) = state.orchestrator.presets().get(&join.agent) else {
        session.send(ServerMessage::error(
            ErrorCode::AgentInvalid,
            format!("unknown agent '{}'", join.agent.trim()),
        ));
        return;
    };
    let thread_id = join
        .thread_id
        .filter(|t| !t.trim().is_empty())
        .map(ThreadId::from);
    if preset.memory_policy.requires_thread() && thread_id.is_none() {
        session.send(ServerMessage::error(
            ErrorCode::MemThreadRequired,
            format!("agent '{}' requires a thread_id", preset.name),
        ));
        return;
    }

    let route = Route {
        agent: preset.name.clone(),
        thread_id,
        owner: session.id,
    };
    match state.stt.subscribe(&join.stt_url, client_id.clone(), route).await {
        Ok(()) => {
            info!(connection = %session.id, url = %join.stt_url, client_id = %client_id, "stt joined");
            session.send(ServerMessage::SttJoined {
                stt_url: join.stt_url,
                client_id: client_id.to_string(),
            });
        }
        Err(e) => {
            warn!(url = %join.stt_url, client_id = %client_id, error = %e, "stt join failed");
            session.send(ServerMessage::error(e.code(), e.to_string()));
        }
    }
}

async fn leave_stt(state: &AppState, session: &Session, leave: LeaveSttPayload) {
    let client_id = ClientId::from(leave.client_id.trim());
    match state
        .stt
        .unsubscribe(&leave.stt_url, &client_id, session.id)
        .await
    {
        Ok(()) => session.send(ServerMessage::SttLeft {
            stt_url: leave.stt_url,
            client_id: client_id.to_string(),
        }),
        Err(e) => session.send(ServerMessage::error(e.code(), e.to_string())),
    }
}

async fn join_tts(state: &AppState, session: &Arc<Session>, join: JoinTtsPayload) {
    let client_id = ClientId::from(join.client_id.trim());
    if client_id.as_str().is_empty() {
        session.send(ServerMessage::error(ErrorCode::BadRequest, "clientId is empty"));
        return;
    }
    let audio = match state
        .tts
        .join(client_id.clone(), session.id, join.voice, join.speed)
        .await
    {
        Ok(audio) => audio,
        Err(e) => {
            warn!(client_id = %client_id, error = %e, "tts join failed");
            session.send(ServerMessage::error(e.code(), e.to_string()));
            return;
        }
    };

    // Task: synthesized audio -> this session, until the client leaves.
    let forward_session = Arc::clone(session);
    let forward_client = client_id.clone();
    tokio::spawn(async move {
        while let Ok(output) = audio.recv_async().await {
            match output {
                TtsOutput::Audio(bytes) => {
                    let frame = AudioFrame::new(forward_client.clone(), bytes);
                    match frame.encode() {
                        Ok(encoded) => {
                            if !forward_session.send_audio(encoded) {
                                break;
                            }
                        }
                        Err(e) => warn!(client_id = %forward_client, error = %e, "cannot frame audio"),
                    }
                }
                TtsOutput::Stop => forward_session.send(ServerMessage::TtsStop {
                    client_id: forward_client.to_string(),
                }),
            }
        }
        debug!(client_id = %forward_client, "tts forwarder finished");
    });

    session.set_tts_client(client_id.clone());
    info!(connection = %session.id, client_id = %client_id, "tts joined");
    session.send(ServerMessage::TtsJoined {
        client_id: client_id.to_string(),
    });
}

async fn leave_tts(state: &AppState, session: &Session, leave: LeaveTtsPayload) {
    let client_id = ClientId::from(leave.client_id.trim());
    match state.tts.leave(&client_id, session.id).await {
        Ok(()) => {
            session.clear_tts_client(&client_id);
            session.send(ServerMessage::TtsLeft {
                client_id: client_id.to_string(),
            });
        }
        Err(e) => session.send(ServerMessage::error(e.code(), e.to_string())),
    }
}

async fn handle_audio(state: &AppState, session: &Session, data: &[u8]) {
    match AudioFrame::decode(data) {
        Ok(frame) => {
            state.stt.relay_audio(session.id, frame).await;
        }
        Err(e) => {
            debug!(connection = %session.id, error = %e, "bad audio frame");
            session.send(ServerMessage::error(ErrorCode::BadRequest, e.to_string()));
        }
    }
}
