//! Core layer tests: configuration loading, statuses, errors, and the event bus.

#[cfg(test)]
mod tests {
    use std::io;
    use std::time::Duration;

    use tcplink_core::*;

    // ─────────────────────────────────────────────────────────────────────
    // Configuration
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn client_config_defaults() {
        let config = ClientConfig::default();
        assert!(config.socket.no_delay);
        assert_eq!(config.socket.receive_buffer_size, 8192);
        assert_eq!(config.connect_timeout_duration(), Duration::from_secs(5));
        assert!(!config.auto_reconnect);
        assert_eq!(config.reconnect_interval_duration(), Duration::from_secs(3));
        assert_eq!(config.max_reconnect_attempts, None);
        assert_eq!(config.socket.receive_timeout_duration(), None);
    }

    #[test]
    fn builders_set_durations_in_ms() {
        let config = ClientConfig::new()
            .connect_timeout(Duration::from_millis(1500))
            .reconnect_interval(Duration::from_millis(250))
            .max_reconnect_attempts(3)
            .socket_config(SocketConfig::new().send_timeout(Duration::from_secs(2)));
        assert_eq!(config.connect_timeout_ms, 1500);
        assert_eq!(config.reconnect_interval_ms, 250);
        assert_eq!(config.max_reconnect_attempts, Some(3));
        assert_eq!(config.socket.send_timeout_duration(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn link_config_partial_json_takes_defaults() {
        let config = LinkConfig::from_json_str(
            r#"{
                "client": { "autoReconnect": true, "reconnectIntervalMs": 500 },
                "server": { "maxConnections": 16, "socket": { "noDelay": false } }
            }"#,
        )
        .unwrap();

        assert!(config.client.auto_reconnect);
        assert_eq!(config.client.reconnect_interval_ms, 500);
        assert_eq!(config.client.connect_timeout_ms, 5_000);
        assert_eq!(config.server.max_connections, Some(16));
        assert!(!config.server.socket.no_delay);
        assert_eq!(config.server.poll_interval_ms, 100);
    }

    #[test]
    fn link_config_serializes_camel_case() {
        let json = serde_json::to_value(ServerConfig::default()).unwrap();
        assert_eq!(json["pollIntervalMs"], 100);
        assert_eq!(json["socket"]["receiveBufferSize"], 8192);
        assert!(json["maxConnections"].is_null());
    }

    #[test]
    fn link_config_rejects_invalid_values() {
        let err = LinkConfig::from_json_str(r#"{"client": {"connectTimeoutMs": 0}}"#).unwrap_err();
        assert!(err.to_string().contains("connectTimeoutMs"));

        let err = LinkConfig::from_json_str(r#"{"server": {"pollIntervalMs": 0}}"#).unwrap_err();
        assert!(err.to_string().contains("pollIntervalMs"));

        let err = LinkConfig::from_json_str(r#"{"server": {"socket": {"sendBufferSize": 0}}}"#).unwrap_err();
        assert!(err.to_string().contains("sendBufferSize"));

        let err = LinkConfig::from_json_str("not json").unwrap_err();
        assert!(matches!(err, LinkError::Config(_)));
    }

    #[test]
    fn link_config_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("tcplink.json");
        std::fs::write(&path, r#"{"client": {"maxReconnectAttempts": 5}}"#).unwrap();

        let config = LinkConfig::from_json_file(&path).unwrap();
        assert_eq!(config.client.max_reconnect_attempts, Some(5));
        assert_eq!(config.server, ServerConfig::default());

        let err = LinkConfig::from_json_file(dir.path().join("missing.json")).unwrap_err();
        assert!(matches!(err, LinkError::Config(msg) if msg.contains("missing.json")));
    }

    #[test]
    fn normalized_replaces_zero_values_with_defaults() {
        let client = ClientConfig {
            connect_timeout_ms: 0,
            event_capacity: 0,
            ..ClientConfig::default()
        }
        .normalized();
        assert_eq!(client.connect_timeout_ms, 5_000);
        assert_eq!(client.event_capacity, 1024);
        client.validate().unwrap();

        let server = ServerConfig::new()
            .poll_interval(Duration::ZERO)
            .socket_config(SocketConfig::new().receive_buffer_size(0))
            .normalized();
        assert_eq!(server.poll_interval_ms, 100);
        assert_eq!(server.socket.receive_buffer_size, 8192);
        server.validate().unwrap();

        // Non-zero values are kept
        let custom = ServerConfig::new().poll_interval(Duration::from_millis(7)).normalized();
        assert_eq!(custom.poll_interval_ms, 7);
    }

    // ─────────────────────────────────────────────────────────────────────
    // Statuses
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn connection_status_transitions() {
        assert_eq!(ConnectionStatus::default(), ConnectionStatus::Idle);
        assert!(ConnectionStatus::Idle.can_connect());
        assert!(ConnectionStatus::Disconnected.can_connect());
        assert!(ConnectionStatus::Error.can_connect());
        assert!(!ConnectionStatus::Connecting.can_connect());
        assert!(!ConnectionStatus::Connected.can_connect());
    }

    #[test]
    fn server_status_transitions() {
        assert_eq!(ServerStatus::default(), ServerStatus::Stopped);
        assert!(ServerStatus::Stopped.can_start());
        assert!(ServerStatus::Error.can_start());
        assert!(!ServerStatus::Running.can_start());
        assert!(!ServerStatus::Starting.can_start());
        assert!(!ServerStatus::Stopping.can_start());
    }

    // ─────────────────────────────────────────────────────────────────────
    // Errors
    // ─────────────────────────────────────────────────────────────────────

    #[test]
    fn invalid_state_message_names_operation_and_state() {
        let err = LinkError::invalid_state("connect", ConnectionStatus::Connected);
        assert_eq!(err.to_string(), "cannot connect while Connected");

        let err = LinkError::invalid_state("start", ServerStatus::Running);
        assert_eq!(err.to_string(), "cannot start while Running");
    }

    #[test]
    fn transport_error_classification() {
        for kind in [
            io::ErrorKind::ConnectionReset,
            io::ErrorKind::BrokenPipe,
            io::ErrorKind::UnexpectedEof,
            io::ErrorKind::TimedOut,
        ] {
            assert!(is_transport_error(&io::Error::from(kind)), "{kind:?}");
        }
        assert!(!is_transport_error(&io::Error::from(io::ErrorKind::WouldBlock)));
        assert!(!is_transport_error(&io::Error::from(io::ErrorKind::PermissionDenied)));
    }

    #[test]
    fn disconnect_reason_origin() {
        assert!(DisconnectReason::RemoteClosed.is_peer_initiated());
        assert!(DisconnectReason::Transport("reset".into()).is_peer_initiated());
        assert!(!DisconnectReason::Manual.is_peer_initiated());
        assert!(!DisconnectReason::ServerStopping.is_peer_initiated());
        assert_eq!(DisconnectReason::Kicked.to_string(), "disconnected by server");
    }

    // ─────────────────────────────────────────────────────────────────────
    // Event bus
    // ─────────────────────────────────────────────────────────────────────

    #[tokio::test]
    async fn event_bus_fans_out_to_every_subscriber() {
        let bus = EventBus::new(8);
        let mut first = bus.subscribe();
        let mut second = bus.subscribe();
        assert_eq!(bus.subscriber_count(), 2);

        bus.emit(LinkEvent::data_received("conn-1", vec![1u8, 2, 3]));

        for rx in [&mut first, &mut second] {
            match rx.recv().await.unwrap() {
                LinkEvent::DataReceived(data) => {
                    assert_eq!(data.id, "conn-1");
                    assert_eq!(&data.bytes[..], &[1, 2, 3]);
                }
                other => panic!("unexpected event: {other:?}"),
            }
        }
    }

    #[tokio::test]
    async fn slow_subscriber_lags_and_loses_oldest_events() {
        let bus = EventBus::new(2);
        let mut slow = bus.subscribe();

        bus.emit(LinkEvent::connected("conn-1", "127.0.0.1:1"));
        bus.emit(LinkEvent::data_received("conn-1", vec![1u8]));
        bus.emit(LinkEvent::disconnected("conn-1", DisconnectReason::RemoteClosed));

        assert!(matches!(
            slow.recv().await,
            Err(tokio::sync::broadcast::error::RecvError::Lagged(1))
        ));
        // The Connected event is gone; delivery resumes with the newest ones
        assert!(matches!(slow.recv().await, Ok(LinkEvent::DataReceived(_))));
        assert!(matches!(slow.recv().await, Ok(LinkEvent::Disconnected(_))));
    }

    #[test]
    fn event_bus_without_subscribers_drops_events() {
        let bus = EventBus::default();
        bus.emit(LinkEvent::server_stopped("server-1"));
        assert_eq!(bus.subscriber_count(), 0);
    }

    #[test]
    fn error_event_keeps_cause() {
        let event = LinkEvent::error("client-1", "boom", Some(LinkError::NotConnected));
        assert_eq!(event.id(), "client-1");
        match event {
            LinkEvent::Error(e) => {
                assert_eq!(e.message, "boom");
                assert!(matches!(e.cause.as_deref(), Some(LinkError::NotConnected)));
            }
            other => panic!("unexpected event: {other:?}"),
        }
    }
}
