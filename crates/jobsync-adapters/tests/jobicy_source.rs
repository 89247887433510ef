use jobsync_adapters::{AdapterError, Endpoints, JobicySource, RemoteSource};
use jobsync_storage::{HttpClientConfig, HttpFetcher};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpListener;

/// Serves one canned HTTP response and returns the listener's address.
async fn one_shot_server(response: &'static [u8]) -> std::net::SocketAddr {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let (mut socket, _) = listener.accept().await.unwrap();
        let mut buf = [0u8; 1024];
        let _ = socket.read(&mut buf).await;
        socket.write_all(response).await.unwrap();
    });
    addr
}

fn source_with_locations_url(url: String) -> JobicySource {
    let http = HttpFetcher::new(HttpClientConfig::default()).unwrap();
    JobicySource::new(
        http,
        Endpoints {
            locations_url: url,
            ..Endpoints::default()
        },
    )
}

#[tokio::test]
async fn server_error_status_reads_as_unavailable() {
    let addr = one_shot_server(
        b"HTTP/1.1 500 Internal Server Error\r\ncontent-length: 0\r\nconnection: close\r\n\r\n",
    )
    .await;
    let url = format!("http://{addr}/locations");
    let source = source_with_locations_url(url.clone());

    let err = source.fetch_locations().await.unwrap_err();
    match err {
        AdapterError::RemoteUnavailable { url: failed, reason } => {
            assert_eq!(failed, url);
            assert!(reason.contains("500"), "reason was {reason}");
        }
        other => panic!("expected RemoteUnavailable, got {other:?}"),
    }
}

#[tokio::test]
async fn success_with_bad_body_reads_as_malformed() {
    let addr = one_shot_server(
        b"HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: 2\r\nconnection: close\r\n\r\n{}",
    )
    .await;
    let source = source_with_locations_url(format!("http://{addr}/locations"));

    let err = source.fetch_locations().await.unwrap_err();
    assert!(matches!(err, AdapterError::MalformedResponse { .. }));
}
