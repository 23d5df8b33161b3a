//! Hub WebSocket session driver
//!
//! Owns one connection to the hub at a time: dials, authenticates,
//! subscribes, then pumps event frames into the pipeline queue while
//! answering for liveness with application-level pings. Connection loss
//! feeds the lifecycle state machine and the session re-dials with
//! exponential backoff until the attempt budget runs out.

use crate::config::HubConfig;
use crate::error::SessionError;
use crate::events::Timestamp;
use crate::metrics::MetricsAggregator;
use crate::session::frames::{ClientFrame, ServerFrame};
use crate::session::state::{
    BackoffPolicy, ConnectionState, SessionEvent, SessionFsm, MAX_MISSED_HEARTBEATS,
};
use chrono::Utc;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use log::{debug, error, info, trace, warn};
use rand::rngs::StdRng;
use rand::SeedableRng;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio::time::{interval, timeout, MissedTickBehavior};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;
type WsSink = SplitSink<WsStream, Message>;
type WsSource = SplitStream<WsStream>;

/// One raw hub event plus the moment this process received it
#[derive(Debug, Clone)]
pub struct InboundEvent {
    /// The inner event object of the hub's event frame
    pub payload: serde_json::Value,
    pub received_at: Timestamp,
}

/// Connection session between this process and the hub
///
/// Created with the channels it reports through: raw events go to
/// `event_tx`, lifecycle states to `state_tx`, and a `true` on the
/// shutdown channel ends the session cleanly.
pub struct HubSession {
    config: HubConfig,
    metrics: Arc<MetricsAggregator>,
    event_tx: mpsc::Sender<InboundEvent>,
    state_tx: watch::Sender<ConnectionState>,
    shutdown: watch::Receiver<bool>,
}

impl HubSession {
    pub fn new(
        config: HubConfig,
        metrics: Arc<MetricsAggregator>,
        event_tx: mpsc::Sender<InboundEvent>,
        state_tx: watch::Sender<ConnectionState>,
        shutdown: watch::Receiver<bool>,
    ) -> Self {
        Self {
            config,
            metrics,
            event_tx,
            state_tx,
            shutdown,
        }
    }

    /// Run the session until shutdown or a fatal error
    ///
    /// Transport failures are retried with backoff. Auth rejection and an
    /// exhausted attempt budget end the session with an error; a shutdown
    /// request ends it with `Ok`.
    ///
    /// # Errors
    ///
    /// Returns the fatal `SessionError` that ended the session.
    pub async fn run(mut self) -> Result<(), SessionError> {
        let mut fsm = SessionFsm::new(self.config.max_reconnect_attempts);
        let backoff = BackoffPolicy::new(
            Duration::from_millis(self.config.reconnect_base_delay_ms),
            Duration::from_millis(self.config.reconnect_max_delay_ms),
        );
        let mut rng = StdRng::from_entropy();

        loop {
            self.publish_state(fsm.state());
            match self.run_connection(&mut fsm).await {
                Ok(()) => {
                    let state = fsm.apply(SessionEvent::ShutdownRequested);
                    self.publish_state(state);
                    info!("Hub session shut down");
                    return Ok(());
                }
                Err(err) if err.is_fatal() => {
                    error!("Hub session failed: {}", err);
                    let state = fsm.apply(SessionEvent::AuthFailed);
                    self.publish_state(state);
                    return Err(err);
                }
                Err(err) => {
                    warn!("Hub connection lost: {}", err);
                    match fsm.apply(SessionEvent::TransportLost) {
                        ConnectionState::Reconnecting { attempt } => {
                            self.publish_state(ConnectionState::Reconnecting { attempt });
                            let delay = backoff.delay(attempt, &mut rng);
                            info!(
                                "Reconnecting to hub in {:?} (attempt {}/{})",
                                delay, attempt, self.config.max_reconnect_attempts
                            );
                            let mut shutdown = self.shutdown.clone();
                            tokio::select! {
                                _ = tokio::time::sleep(delay) => {}
                                _ = wait_for_shutdown(&mut shutdown) => {
                                    let state = fsm.apply(SessionEvent::ShutdownRequested);
                                    self.publish_state(state);
                                    return Ok(());
                                }
                            }
                        }
                        _ => {
                            error!(
                                "Giving up on hub after {} reconnect attempts",
                                self.config.max_reconnect_attempts
                            );
                            self.publish_state(ConnectionState::Closed);
                            return Err(SessionError::ReconnectExhausted {
                                attempts: self.config.max_reconnect_attempts,
                            });
                        }
                    }
                }
            }
        }
    }

    /// Drive a single connection; `Ok` means shutdown was requested
    async fn run_connection(&mut self, fsm: &mut SessionFsm) -> Result<(), SessionError> {
        debug!("Dialing hub at {}", self.config.url);
        let (ws_stream, _) = connect_async(self.config.url.as_str()).await?;
        let state = fsm.apply(SessionEvent::TransportOpened);
        self.publish_state(state);

        let (mut write, mut read) = ws_stream.split();

        self.authenticate(&mut write, &mut read).await?;
        let state = fsm.apply(SessionEvent::AuthAccepted);
        self.publish_state(state);
        info!("Authenticated with hub at {}", self.config.url);

        let mut next_id: u64 = 1;
        self.subscribe(&mut write, &mut next_id).await?;

        let mut heartbeat = interval(self.config.heartbeat_interval());
        heartbeat.set_missed_tick_behavior(MissedTickBehavior::Delay);
        // the first tick completes immediately; consume it
        heartbeat.tick().await;

        let mut awaiting_pong: Option<u64> = None;
        let mut shutdown = self.shutdown.clone();

        loop {
            tokio::select! {
                _ = wait_for_shutdown(&mut shutdown) => {
                    info!("Shutdown requested; closing hub session");
                    let _ = write.send(Message::Close(None)).await;
                    return Ok(());
                }
                _ = heartbeat.tick() => {
                    if awaiting_pong.is_some() {
                        let state = fsm.apply(SessionEvent::HeartbeatMissed);
                        self.publish_state(state);
                        warn!(
                            "Heartbeat unanswered ({} of {})",
                            fsm.missed_heartbeats(),
                            MAX_MISSED_HEARTBEATS
                        );
                        if state == ConnectionState::Degraded {
                            return Err(SessionError::Protocol(
                                "hub stopped answering heartbeats".to_string(),
                            ));
                        }
                    }
                    let id = next_id;
                    next_id += 1;
                    awaiting_pong = Some(id);
                    write.send(encode(&ClientFrame::Ping { id })?).await?;
                }
                frame = read.next() => match frame {
                    Some(Ok(Message::Text(text))) => {
                        self.handle_frame(&text, fsm, &mut awaiting_pong).await?;
                    }
                    Some(Ok(Message::Ping(data))) => {
                        write.send(Message::Pong(data)).await?;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        return Err(SessionError::Protocol(
                            "connection closed by hub".to_string(),
                        ));
                    }
                    Some(Ok(_)) => {}
                    Some(Err(e)) => return Err(SessionError::Transport(e)),
                },
            }
        }
    }

    /// Complete the auth handshake within the configured timeout
    async fn authenticate(
        &self,
        write: &mut WsSink,
        read: &mut WsSource,
    ) -> Result<(), SessionError> {
        let handshake = async {
            loop {
                let frame = match read.next().await {
                    Some(Ok(Message::Text(text))) => serde_json::from_str::<ServerFrame>(&text)
                        .map_err(|e| {
                            SessionError::Protocol(format!("bad handshake frame: {}", e))
                        })?,
                    Some(Ok(Message::Close(_))) | None => {
                        return Err(SessionError::Protocol(
                            "connection closed during handshake".to_string(),
                        ));
                    }
                    Some(Ok(_)) => continue,
                    Some(Err(e)) => return Err(SessionError::Transport(e)),
                };

                match frame {
                    ServerFrame::AuthRequired { ha_version } => {
                        if let Some(version) = ha_version {
                            debug!("Hub reports version {}", version);
                        }
                        let auth = ClientFrame::Auth {
                            access_token: self.config.access_token.clone(),
                        };
                        write.send(encode(&auth)?).await?;
                    }
                    ServerFrame::AuthOk { .. } => return Ok(()),
                    ServerFrame::AuthInvalid { message } => {
                        return Err(SessionError::AuthRejected(
                            message.unwrap_or_else(|| "no reason given".to_string()),
                        ));
                    }
                    _ => {
                        return Err(SessionError::Protocol(
                            "unexpected frame during handshake".to_string(),
                        ));
                    }
                }
            }
        };

        timeout(self.config.auth_timeout(), handshake)
            .await
            .map_err(|_| SessionError::AuthTimeout(self.config.auth_timeout_ms))?
    }

    /// Issue the event subscriptions for this connection
    ///
    /// Re-run after every reconnect, since the hub forgets subscriptions
    /// when the socket drops.
    async fn subscribe(&self, write: &mut WsSink, next_id: &mut u64) -> Result<(), SessionError> {
        let subscriptions: Vec<Option<String>> = if self.config.subscribed_event_types.is_empty() {
            vec![None]
        } else {
            self.config
                .subscribed_event_types
                .iter()
                .cloned()
                .map(Some)
                .collect()
        };

        for event_type in subscriptions {
            let id = *next_id;
            *next_id += 1;
            match &event_type {
                Some(name) => info!("Subscribing to {} events", name),
                None => info!("Subscribing to all hub events"),
            }
            write
                .send(encode(&ClientFrame::SubscribeEvents { id, event_type })?)
                .await?;
        }
        Ok(())
    }

    /// Handle one text frame from the established connection
    async fn handle_frame(
        &self,
        text: &str,
        fsm: &mut SessionFsm,
        awaiting_pong: &mut Option<u64>,
    ) -> Result<(), SessionError> {
        let frame = match serde_json::from_str::<ServerFrame>(text) {
            Ok(frame) => frame,
            Err(e) => {
                debug!("Discarding unparseable frame: {}", e);
                self.metrics.record_parse_failure();
                return Ok(());
            }
        };

        match frame {
            ServerFrame::Event { event, .. } => {
                let inbound = InboundEvent {
                    payload: event,
                    received_at: Utc::now(),
                };
                match self.event_tx.try_send(inbound) {
                    Ok(()) => {}
                    Err(mpsc::error::TrySendError::Full(inbound)) => {
                        self.metrics.record_saturation_wait();
                        trace!("Worker queue full; waiting for capacity");
                        self.event_tx.send(inbound).await.map_err(|_| {
                            SessionError::Protocol("event pipeline is gone".to_string())
                        })?;
                    }
                    Err(mpsc::error::TrySendError::Closed(_)) => {
                        return Err(SessionError::Protocol(
                            "event pipeline is gone".to_string(),
                        ));
                    }
                }
            }
            ServerFrame::Pong { id } => {
                if *awaiting_pong == Some(id) {
                    *awaiting_pong = None;
                    let state = fsm.apply(SessionEvent::PongReceived);
                    self.publish_state(state);
                }
            }
            ServerFrame::CommandResult { id, success, error } => {
                if success {
                    debug!("Hub acknowledged command {}", id);
                } else {
                    warn!("Hub rejected command {}: {:?}", id, error);
                }
            }
            ServerFrame::AuthRequired { .. }
            | ServerFrame::AuthOk { .. }
            | ServerFrame::AuthInvalid { .. } => {
                debug!("Ignoring stray auth frame outside handshake");
            }
            ServerFrame::Unknown => {
                trace!("Ignoring unrecognized frame");
            }
        }
        Ok(())
    }

    fn publish_state(&self, state: ConnectionState) {
        let changed = self.state_tx.send_if_modified(|current| {
            if *current == state {
                false
            } else {
                *current = state;
                true
            }
        });
        if changed {
            match state {
                ConnectionState::Degraded => warn!("Connection state: {}", state.label()),
                _ => info!("Connection state: {}", state.label()),
            }
        }
    }
}

fn encode(frame: &ClientFrame) -> Result<Message, SessionError> {
    let json = serde_json::to_string(frame)
        .map_err(|e| SessionError::Protocol(format!("failed to encode frame: {}", e)))?;
    Ok(Message::Text(json))
}

/// Resolve once shutdown is requested or the shutdown channel is gone
pub(crate) async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    loop {
        if *shutdown.borrow() {
            return;
        }
        if shutdown.changed().await.is_err() {
            return;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::net::SocketAddr;
    use tokio::net::TcpListener;
    use tokio_tungstenite::accept_async;

    type ServerWs = WebSocketStream<TcpStream>;

    fn create_test_config(addr: SocketAddr) -> HubConfig {
        HubConfig {
            url: format!("ws://{}", addr),
            access_token: "secret-token".to_string(),
            subscribed_event_types: Vec::new(),
            heartbeat_interval_ms: 60_000,
            auth_timeout_ms: 5_000,
            reconnect_base_delay_ms: 10,
            reconnect_max_delay_ms: 20,
            max_reconnect_attempts: 0,
        }
    }

    fn create_test_session(
        config: HubConfig,
    ) -> (
        HubSession,
        mpsc::Receiver<InboundEvent>,
        watch::Receiver<ConnectionState>,
        watch::Sender<bool>,
    ) {
        let (event_tx, event_rx) = mpsc::channel(16);
        let (state_tx, state_rx) = watch::channel(ConnectionState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let metrics = Arc::new(MetricsAggregator::new());
        let session = HubSession::new(config, metrics, event_tx, state_tx, shutdown_rx);
        (session, event_rx, state_rx, shutdown_tx)
    }

    async fn expect_client_frame(ws: &mut ServerWs) -> ClientFrame {
        loop {
            match ws.next().await {
                Some(Ok(Message::Text(text))) => {
                    return serde_json::from_str(&text).expect("client sent invalid frame")
                }
                Some(Ok(_)) => continue,
                other => panic!("expected client frame, got {:?}", other),
            }
        }
    }

    async fn send_server_frame(ws: &mut ServerWs, frame: &ServerFrame) {
        let json = serde_json::to_string(frame).unwrap();
        ws.send(Message::Text(json)).await.unwrap();
    }

    async fn accept_and_authenticate(listener: &TcpListener) -> ServerWs {
        let (stream, _) = listener.accept().await.unwrap();
        let mut ws = accept_async(stream).await.unwrap();

        send_server_frame(&mut ws, &ServerFrame::AuthRequired { ha_version: None }).await;
        match expect_client_frame(&mut ws).await {
            ClientFrame::Auth { access_token } => assert_eq!(access_token, "secret-token"),
            other => panic!("expected auth frame, got {:?}", other),
        }
        send_server_frame(&mut ws, &ServerFrame::AuthOk { ha_version: None }).await;
        ws
    }

    #[tokio::test]
    async fn test_session_authenticates_subscribes_and_delivers_events() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let mut ws = accept_and_authenticate(&listener).await;

            match expect_client_frame(&mut ws).await {
                ClientFrame::SubscribeEvents { id, event_type } => {
                    assert_eq!(id, 1);
                    assert_eq!(event_type, None);
                    send_server_frame(
                        &mut ws,
                        &ServerFrame::CommandResult {
                            id,
                            success: true,
                            error: None,
                        },
                    )
                    .await;
                }
                other => panic!("expected subscribe frame, got {:?}", other),
            }

            send_server_frame(
                &mut ws,
                &ServerFrame::Event {
                    id: Some(1),
                    event: json!({
                        "event_type": "state_changed",
                        "data": { "entity_id": "light.kitchen" }
                    }),
                },
            )
            .await;
            // dropping the socket ends the client's connection
        });

        let (session, mut event_rx, state_rx, _shutdown_tx) =
            create_test_session(create_test_config(addr));
        let handle = tokio::spawn(session.run());

        let inbound = timeout(Duration::from_secs(5), event_rx.recv())
            .await
            .expect("timed out waiting for event")
            .expect("event channel closed");
        assert_eq!(inbound.payload["event_type"], "state_changed");
        assert_eq!(inbound.payload["data"]["entity_id"], "light.kitchen");

        let result = timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert!(matches!(
            result,
            Err(SessionError::ReconnectExhausted { .. })
        ));
        assert_eq!(*state_rx.borrow(), ConnectionState::Closed);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_full_queue_blocks_the_read_loop_without_dropping_events() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let mut ws = accept_and_authenticate(&listener).await;
            expect_client_frame(&mut ws).await; // subscribe

            for i in 0..5 {
                send_server_frame(
                    &mut ws,
                    &ServerFrame::Event {
                        id: Some(1),
                        event: json!({
                            "event_type": "state_changed",
                            "data": { "entity_id": format!("sensor.unit_{}", i) }
                        }),
                    },
                )
                .await;
            }

            // hold the socket open until the client closes it
            while let Some(Ok(message)) = ws.next().await {
                if matches!(message, Message::Close(_)) {
                    break;
                }
            }
        });

        let (event_tx, mut event_rx) = mpsc::channel(1);
        let (state_tx, _state_rx) = watch::channel(ConnectionState::Connecting);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let metrics = Arc::new(MetricsAggregator::new());
        let session = HubSession::new(
            create_test_config(addr),
            metrics.clone(),
            event_tx,
            state_tx,
            shutdown_rx,
        );
        let handle = tokio::spawn(session.run());

        // nothing drains the queue yet, so the reader must hit the full
        // channel and fall back to the blocking send
        let saturated = async {
            while metrics.snapshot().saturation_waits == 0 {
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        };
        timeout(Duration::from_secs(5), saturated)
            .await
            .expect("reader never observed a full queue");

        let mut received = Vec::new();
        for _ in 0..5 {
            let inbound = timeout(Duration::from_secs(5), event_rx.recv())
                .await
                .expect("timed out draining events")
                .expect("event channel closed");
            received.push(
                inbound.payload["data"]["entity_id"]
                    .as_str()
                    .expect("event without entity id")
                    .to_string(),
            );
        }

        let expected: Vec<String> = (0..5).map(|i| format!("sensor.unit_{}", i)).collect();
        assert_eq!(received, expected);
        assert!(metrics.snapshot().saturation_waits >= 1);

        shutdown_tx.send(true).unwrap();
        let result = timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert!(result.is_ok());
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_rejected_token_is_fatal_without_retry() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let (stream, _) = listener.accept().await.unwrap();
            let mut ws = accept_async(stream).await.unwrap();

            send_server_frame(&mut ws, &ServerFrame::AuthRequired { ha_version: None }).await;
            expect_client_frame(&mut ws).await;
            send_server_frame(
                &mut ws,
                &ServerFrame::AuthInvalid {
                    message: Some("Invalid access token".to_string()),
                },
            )
            .await;
        });

        let mut config = create_test_config(addr);
        config.max_reconnect_attempts = 5;
        let (session, _event_rx, state_rx, _shutdown_tx) = create_test_session(config);

        let result = timeout(Duration::from_secs(5), session.run()).await.unwrap();
        match result {
            Err(SessionError::AuthRejected(message)) => {
                assert_eq!(message, "Invalid access token");
            }
            other => panic!("expected auth rejection, got {:?}", other),
        }
        assert_eq!(*state_rx.borrow(), ConnectionState::Closed);
        server.await.unwrap();
    }

    #[tokio::test]
    async fn test_unanswered_heartbeats_tear_the_connection_down() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let mut ws = accept_and_authenticate(&listener).await;
            expect_client_frame(&mut ws).await; // subscribe

            // swallow pings until the client gives up and drops the socket
            let mut pings = 0usize;
            while let Some(Ok(message)) = ws.next().await {
                if matches!(message, Message::Text(_)) {
                    pings += 1;
                }
            }
            pings
        });

        let mut config = create_test_config(addr);
        config.heartbeat_interval_ms = 50;
        let (session, _event_rx, _state_rx, _shutdown_tx) = create_test_session(config);

        let result = timeout(Duration::from_secs(5), session.run()).await.unwrap();
        assert!(matches!(
            result,
            Err(SessionError::ReconnectExhausted { .. })
        ));

        let pings = server.await.unwrap();
        assert!(pings >= 2, "expected at least two pings, saw {}", pings);
    }

    #[tokio::test]
    async fn test_shutdown_request_ends_the_session_cleanly() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();

        let server = tokio::spawn(async move {
            let mut ws = accept_and_authenticate(&listener).await;
            expect_client_frame(&mut ws).await; // subscribe

            // drain until the client closes
            while let Some(Ok(message)) = ws.next().await {
                if matches!(message, Message::Close(_)) {
                    break;
                }
            }
        });

        let (session, _event_rx, state_rx, shutdown_tx) =
            create_test_session(create_test_config(addr));
        let handle = tokio::spawn(session.run());

        // give the session a moment to establish before asking it to stop
        tokio::time::sleep(Duration::from_millis(200)).await;
        shutdown_tx.send(true).unwrap();

        let result = timeout(Duration::from_secs(5), handle).await.unwrap().unwrap();
        assert!(result.is_ok());
        assert_eq!(*state_rx.borrow(), ConnectionState::Closed);
        server.await.unwrap();
    }
}
