//! Handshake and version negotiation between real client and server roles.

mod common;

use std::sync::Arc;

use assert_matches::assert_matches;
use rstest::rstest;
use tokio::sync::Barrier;
use tokio::time::timeout;

use common::{TestSession, TEST_TIMEOUT};
use peerwire_mcp::{
    protocol::{
        ClientCapabilities, EmptyCapability, ServerCapabilities, ToolsCapability,
        LATEST_PROTOCOL_VERSION,
    },
    transport::Transport,
    ClientOptions, ConnectionState, Error, ServerOptions,
};

#[rstest]
#[case("2025-06-18")]
#[case("2025-03-26")]
#[case("2024-11-05")]
#[case("2024-10-07")]
#[tokio::test]
async fn test_handshake_succeeds_for_every_supported_version(#[case] version: &str) {
    let session = TestSession::with_options(
        ClientCapabilities::default(),
        ServerCapabilities::default(),
        ClientOptions {
            supported_versions: vec![version.to_string()],
            ..Default::default()
        },
        ServerOptions::default(),
    );
    session.connect().await;

    assert_eq!(session.client.protocol_version(), Some(version));
    assert_eq!(session.server.protocol_version(), Some(version));
    assert_eq!(session.client.state(), ConnectionState::Ready);
    assert_eq!(session.server.state(), ConnectionState::Ready);
}

#[tokio::test]
async fn test_handshake_exchanges_identity_and_capabilities() {
    let session = TestSession::with_options(
        ClientCapabilities {
            sampling: Some(EmptyCapability {}),
            ..Default::default()
        },
        ServerCapabilities {
            tools: Some(ToolsCapability {
                list_changed: Some(true),
            }),
            ..Default::default()
        },
        ClientOptions::default(),
        ServerOptions {
            instructions: Some("Use tools sparingly".to_string()),
            ..Default::default()
        },
    );
    session.connect().await;

    let client = &session.client;
    assert_eq!(client.protocol_version(), Some(LATEST_PROTOCOL_VERSION));
    assert_eq!(client.server_info().unwrap().name, "test-server");
    assert_eq!(client.instructions(), Some("Use tools sparingly"));
    assert_eq!(
        client
            .server_capabilities()
            .and_then(|caps| caps.tools.as_ref())
            .and_then(|tools| tools.list_changed),
        Some(true)
    );

    let server = &session.server;
    assert_eq!(server.client_info().unwrap().name, "test-client");
    assert!(server
        .client_capabilities()
        .is_some_and(|caps| caps.sampling.is_some()));
    assert!(server.client_session().is_some());
}

#[tokio::test]
async fn test_unsupported_version_fails_connect_and_closes_transport() {
    let session = TestSession::with_options(
        ClientCapabilities::default(),
        ServerCapabilities::default(),
        ClientOptions::default(),
        ServerOptions {
            supported_versions: vec!["2099-01-01".to_string()],
            ..Default::default()
        },
    );
    session.server.start().await.unwrap();

    let err = timeout(TEST_TIMEOUT, session.client.connect())
        .await
        .unwrap()
        .unwrap_err();
    assert_matches!(err, Error::VersionUnsupported { ref version } if version == "2099-01-01");
    assert_eq!(session.client.state(), ConnectionState::Failed);
    assert!(session.client_transport.is_closed());

    // The server learns about the hang-up through its own transport.
    timeout(TEST_TIMEOUT, async {
        while !session.server_transport.is_closed() {
            tokio::task::yield_now().await;
        }
    })
    .await
    .unwrap();
    assert_matches!(
        session.server.wait_initialized().await,
        Err(Error::ConnectionClosed)
    );
}

#[tokio::test]
async fn test_client_falls_back_when_server_prefers_older_version() {
    let session = TestSession::with_options(
        ClientCapabilities::default(),
        ServerCapabilities::default(),
        ClientOptions {
            supported_versions: vec!["2099-01-01".to_string(), "2024-11-05".to_string()],
            ..Default::default()
        },
        ServerOptions {
            supported_versions: vec!["2024-11-05".to_string()],
            ..Default::default()
        },
    );
    session.connect().await;
    assert_eq!(session.client.protocol_version(), Some("2024-11-05"));
}

#[tokio::test]
async fn test_connect_twice_is_rejected() {
    let session = TestSession::connected(
        ClientCapabilities::default(),
        ServerCapabilities::default(),
    )
    .await;
    assert_matches!(session.client.connect().await, Err(Error::Protocol { .. }));
    assert_eq!(session.client.state(), ConnectionState::Ready);
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_connects_leave_one_live_session() {
    for _ in 0..50 {
        let session = Arc::new(TestSession::new(
            ClientCapabilities::default(),
            ServerCapabilities::default(),
        ));
        session.server.start().await.unwrap();
        let barrier = Arc::new(Barrier::new(2));

        let attempts = (0..2).map(|_| {
            let session = session.clone();
            let barrier = barrier.clone();
            tokio::spawn(async move {
                barrier.wait().await;
                session.client.connect().await
            })
        });
        let mut outcomes = Vec::new();
        for attempt in attempts.collect::<Vec<_>>() {
            outcomes.push(timeout(TEST_TIMEOUT, attempt).await.unwrap().unwrap());
        }

        assert_eq!(outcomes.iter().filter(|o| o.is_ok()).count(), 1);
        assert!(outcomes
            .iter()
            .any(|o| matches!(o, Err(Error::Protocol { .. }))));
        assert_eq!(session.client.state(), ConnectionState::Ready);
        assert!(!session.client_transport.is_closed());
        timeout(TEST_TIMEOUT, session.server.wait_initialized())
            .await
            .unwrap()
            .unwrap();
        timeout(TEST_TIMEOUT, session.client.ping())
            .await
            .unwrap()
            .unwrap();
    }
}
