use super::*;

#[test]
fn defaults_are_valid() {
    let settings = Settings::from_raw(RawSettings::default()).expect("valid settings");

    assert_eq!(settings.server.addr.port(), DEFAULT_PORT);
    assert_eq!(settings.backend.viewer_id, "anonymous");
    assert_eq!(settings.backend.base_url.as_str(), "http://127.0.0.1:3000/");
    assert_eq!(settings.workflow.default_feed, "GLOBAL");
    assert_eq!(settings.listener.recent_event_limit.get(), 50);
    assert_eq!(settings.listener.reconnect_max_attempts, 5);
    assert!(matches!(settings.logging.format, LogFormat::Compact));
}

#[test]
fn cli_overrides_take_highest_precedence() {
    let mut raw = RawSettings::default();
    raw.server.port = Some(4000);
    raw.logging.level = Some("info".to_string());

    let overrides = ServeOverrides {
        server_port: Some(4321),
        logging: LoggingOverrides {
            log_level: Some("debug".to_string()),
            log_json: None,
        },
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.server.addr.port(), 4321);
    assert_eq!(settings.logging.level, LevelFilter::DEBUG);
}

#[test]
fn client_overrides_reach_backend_and_listener() {
    let mut raw = RawSettings::default();
    raw.backend.viewer_id = Some("from-file".to_string());

    let overrides = ClientOverrides {
        backend_url: Some("https://feeds.example.com/api/".to_string()),
        viewer_id: Some("alice".to_string()),
        listener_max_attempts: Some(0),
        ..Default::default()
    };

    raw.apply_client_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert_eq!(settings.backend.viewer_id, "alice");
    assert_eq!(settings.backend.base_url.host_str(), Some("feeds.example.com"));
    assert_eq!(settings.listener.options().reconnect.max_attempts, 0);
}

#[test]
fn cli_json_logging_enforces_format() {
    let mut raw = RawSettings::default();
    let overrides = ServeOverrides {
        logging: LoggingOverrides {
            log_level: None,
            log_json: Some(true),
        },
        ..Default::default()
    };

    raw.apply_serve_overrides(&overrides);
    let settings = Settings::from_raw(raw).expect("valid settings");

    assert!(matches!(settings.logging.format, LogFormat::Json));
}

#[test]
fn rejects_non_http_backend() {
    let mut raw = RawSettings::default();
    raw.backend.base_url = Some("ftp://example.com".to_string());

    let err = Settings::from_raw(raw).unwrap_err();
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "backend.base_url",
            ..
        }
    ));
}

#[test]
fn rejects_inverted_backoff() {
    let mut raw = RawSettings::default();
    raw.listener.reconnect_initial_backoff_ms = Some(2_000);
    raw.listener.reconnect_max_backoff_ms = Some(1_000);

    let err = Settings::from_raw(raw).unwrap_err();
    assert!(matches!(
        err,
        LoadError::Invalid {
            key: "listener.reconnect_max_backoff_ms",
            ..
        }
    ));
}

#[test]
fn zero_attempts_allow_zero_backoff() {
    let mut raw = RawSettings::default();
    raw.listener.reconnect_max_attempts = Some(0);
    raw.listener.reconnect_initial_backoff_ms = Some(0);
    raw.listener.reconnect_max_backoff_ms = Some(0);

    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.listener.options().reconnect, ReconnectPolicy::disabled());
}

#[test]
fn blank_viewer_is_rejected() {
    let mut raw = RawSettings::default();
    raw.backend.viewer_id = Some("  ".to_string());

    assert!(Settings::from_raw(raw).is_err());
}

#[test]
fn blocked_terms_are_normalised() {
    let mut raw = RawSettings::default();
    raw.workflow.blocked_terms = Some(vec![" Spam ".to_string(), "".to_string()]);

    let settings = Settings::from_raw(raw).expect("valid settings");
    assert_eq!(settings.workflow.blocked_terms, vec!["spam".to_string()]);
}

#[test]
fn default_to_serve_command() {
    let args = CliArgs::parse_from(["feedsync"]);
    let command = args
        .command
        .unwrap_or(Command::Serve(Box::<ServeArgs>::default()));
    assert!(matches!(command, Command::Serve(_)));
}

#[test]
fn parse_submit_arguments() {
    let args = CliArgs::parse_from([
        "feedsync",
        "submit",
        "--caption",
        "sunset",
        "--photo-url",
        "https://cdn.test/a.jpg",
        "--photo-key",
        "uploads/a.jpg",
        "--viewer",
        "alice",
    ]);

    match args.command.expect("submit command") {
        Command::Submit(submit) => {
            assert_eq!(submit.caption, "sunset");
            assert_eq!(submit.photo_key, "uploads/a.jpg");
            assert_eq!(submit.client.viewer_id.as_deref(), Some("alice"));
            assert!(submit.feed.is_none());
            assert_eq!(submit.wait_seconds, 10);
        }
        other => panic!("unexpected command: {other:?}"),
    }
}

#[test]
fn parse_watch_arguments() {
    let args = CliArgs::parse_from(["feedsync", "watch", "--feed", "team", "--log-json", "true"]);

    match args.command.expect("watch command") {
        Command::Watch(watch) => {
            assert_eq!(watch.feed.as_deref(), Some("team"));
            assert_eq!(watch.client.logging.log_json, Some(true));
        }
        other => panic!("unexpected command: {other:?}"),
    }
}
