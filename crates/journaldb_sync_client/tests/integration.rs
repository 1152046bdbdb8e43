//! End-to-end replication between a journal server and clients over TCP.

use journaldb_storage::{Journal, JournalKey, PartitionType};
use journaldb_sync_client::{
    spawn_replication, ClientConfig, ClientError, ClientState, JournalClient, RetryConfig,
    SyncEvent,
};
use journaldb_sync_server::{JournalServer, ServerConfig, NOT_EXPORTED};
use journaldb_testkit::fixtures;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

async fn start_server(journal: Arc<Journal>) -> (JournalServer, SocketAddr) {
    init_tracing();
    let config = ServerConfig::new("127.0.0.1:0".parse().unwrap())
        .with_poll_interval(Duration::from_millis(20));
    let mut server = JournalServer::new(config);
    server.export(journal).unwrap();
    let addr = server.start().await.unwrap();
    (server, addr)
}

fn client_config(addr: SocketAddr) -> ClientConfig {
    ClientConfig::new(addr)
        .with_read_timeout(Duration::from_millis(50))
        .with_response_timeout(Duration::from_secs(5))
}

/// Runs blocking client code off the async test thread.
async fn blocking<T: Send + 'static>(f: impl FnOnce() -> T + Send + 'static) -> T {
    tokio::task::spawn_blocking(f).await.unwrap()
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn incremental_replication() {
    let source = fixtures::quote_journal();
    let (mut server, addr) = start_server(source.clone()).await;

    let local = fixtures::quote_journal();
    let mut client = {
        let local = local.clone();
        blocking(move || {
            let mut client = JournalClient::connect(client_config(addr)).unwrap();
            assert_eq!(client.subscribe(fixtures::quote_key(), local), 0);
            client.handshake().unwrap();
            client
        })
        .await
    };

    fixtures::append_quotes(&source, 0, 100);
    source.commit().unwrap();
    let (mut client, first) = blocking(move || {
        let result = client.sync().unwrap();
        (client, result)
    })
    .await;
    assert_eq!(first.updated, vec![0]);
    assert_eq!(first.rows_received, 100);
    assert_eq!(local.size(), 100);
    fixtures::assert_same_rows(&source, &local);

    fixtures::append_quotes(&source, 100, 100);
    source.commit().unwrap();
    let (mut client, second) = blocking(move || {
        let result = client.sync().unwrap();
        (client, result)
    })
    .await;
    assert_eq!(second.rows_received, 100);
    assert_eq!(local.size(), 200);
    fixtures::assert_same_rows(&source, &local);

    let (client, third) = blocking(move || {
        let result = client.sync().unwrap();
        (client, result)
    })
    .await;
    assert!(third.is_empty());
    assert_eq!(third.rows_received, 0);
    assert_eq!(client.state(), ClientState::Synced);
    assert_eq!(client.stats().cycles_completed, 3);
    assert_eq!(client.stats().rows_received, 200);

    server.halt().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn uncommitted_rows_stay_on_the_server() {
    let source = fixtures::quote_journal();
    let (mut server, addr) = start_server(source.clone()).await;

    fixtures::append_quotes(&source, 0, 10);
    source.commit().unwrap();
    fixtures::append_quotes(&source, 10, 5);

    let local = fixtures::quote_journal();
    let target = local.clone();
    blocking(move || {
        let mut client = JournalClient::connect(client_config(addr)).unwrap();
        client.subscribe(fixtures::quote_key(), target);
        client.handshake().unwrap();
        client.sync().unwrap();
    })
    .await;

    assert_eq!(local.size(), 10);
    source.rollback().unwrap();
    fixtures::assert_same_rows(&source, &local);
    server.halt().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn rejections_reach_the_client() {
    let (mut server, addr) = start_server(fixtures::quote_journal()).await;

    blocking(move || {
        let mut client = JournalClient::connect(client_config(addr)).unwrap();
        client.subscribe(
            JournalKey::new("trade", PartitionType::Day),
            fixtures::quote_journal(),
        );
        let err = client.handshake().unwrap_err();
        assert!(matches!(&err, ClientError::Rejected { reason } if reason == NOT_EXPORTED));
        assert!(!err.is_retryable());

        // Default maximum index is 1.
        let mut client = JournalClient::connect(client_config(addr)).unwrap();
        for _ in 0..3 {
            client.subscribe(fixtures::quote_key(), fixtures::quote_journal());
        }
        let err = client.handshake().unwrap_err();
        assert!(
            matches!(&err, ClientError::Rejected { reason } if reason == "Journal index is too large. Max 1")
        );
    })
    .await;

    server.halt().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn client_ahead_of_server_is_rejected() {
    let (mut server, addr) = start_server(fixtures::quote_journal()).await;

    let local = fixtures::quote_journal();
    fixtures::append_quotes(&local, 0, 10);
    local.commit().unwrap();

    blocking(move || {
        let mut client = JournalClient::connect(client_config(addr)).unwrap();
        client.subscribe(fixtures::quote_key(), local);
        client.handshake().unwrap();
        let err = client.sync().unwrap_err();
        assert!(
            matches!(&err, ClientError::Rejected { reason } if reason == "client has 1 partitions, server has 0")
        );
        assert_eq!(client.state(), ClientState::Keyed);
    })
    .await;

    server.halt().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn file_backed_client_resumes_after_reopen() {
    let source = fixtures::quote_journal();
    let (mut server, addr) = start_server(source.clone()).await;
    fixtures::append_quotes(&source, 0, 50);
    source.commit().unwrap();

    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("quote");
    let replicate = move |path: std::path::PathBuf| {
        let local = fixtures::open_quote_journal(&path);
        let mut client = JournalClient::connect(client_config(addr)).unwrap();
        client.subscribe(fixtures::quote_key(), local.clone());
        client.handshake().unwrap();
        let result = client.sync().unwrap();
        (local.size(), result.rows_received)
    };

    let first = {
        let path = path.clone();
        blocking(move || replicate(path)).await
    };
    assert_eq!(first, (50, 50));

    fixtures::append_quotes(&source, 50, 25);
    source.commit().unwrap();
    let second = blocking(move || replicate(path)).await;
    assert_eq!(second, (75, 25));

    server.halt().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn background_replication_follows_the_server() {
    let source = fixtures::quote_journal();
    let (mut server, addr) = start_server(source.clone()).await;
    fixtures::append_quotes(&source, 0, 20);
    source.commit().unwrap();

    let local = fixtures::quote_journal();
    let client = {
        let local = local.clone();
        blocking(move || {
            let mut client = JournalClient::connect(client_config(addr)).unwrap();
            client.subscribe(fixtures::quote_key(), local);
            client
        })
        .await
    };
    let mut replication = spawn_replication(client, Duration::from_millis(20), 4);

    let mut received = 0;
    while received < 20 {
        match replication.next_event().await {
            Some(SyncEvent::Synced(result)) => received += result.rows_received,
            other => panic!("unexpected event: {other:?}"),
        }
    }

    fixtures::append_quotes(&source, 20, 30);
    source.commit().unwrap();
    while received < 50 {
        match replication.next_event().await {
            Some(SyncEvent::Synced(result)) => received += result.rows_received,
            other => panic!("unexpected event: {other:?}"),
        }
    }
    assert!(replication.stats().cycles_completed >= 2);

    let client = replication.stop().await.unwrap();
    assert_eq!(client.stats().rows_received, 50);
    fixtures::assert_same_rows(&source, &local);
    server.halt().await.unwrap();
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn background_replication_gives_up_when_server_goes_away() {
    let (mut server, addr) = start_server(fixtures::quote_journal()).await;

    let client = blocking(move || {
        let config = client_config(addr).with_retry(
            RetryConfig::new(3)
                .with_initial_delay(Duration::from_millis(10))
                .with_jitter(false),
        );
        let mut client = JournalClient::connect(config).unwrap();
        client.subscribe(fixtures::quote_key(), fixtures::quote_journal());
        client
    })
    .await;
    let mut replication = spawn_replication(client, Duration::from_millis(20), 8);

    assert!(matches!(
        replication.next_event().await,
        Some(SyncEvent::Synced(_))
    ));
    server.halt().await.unwrap();

    let mut retries = 0;
    loop {
        match replication.next_event().await {
            Some(SyncEvent::Synced(_)) => {}
            Some(SyncEvent::Retrying { attempt, .. }) => {
                retries += 1;
                assert_eq!(attempt, retries);
            }
            Some(SyncEvent::Failed { .. }) => break,
            None => panic!("replication ended without a failure event"),
        }
    }
    assert_eq!(retries, 2);

    let Err(err) = replication.stop().await else {
        panic!("replication should end with the connection error");
    };
    assert!(err.is_retryable());
}
