use prometheus::Registry;
/// Live Integration Tests for uaproxy
///
/// These tests start the real SOCKS5 listener and push traffic through it
/// to loopback backends.
///
/// Tests included:
/// - Proxy server startup and shutdown
/// - SOCKS5 CONNECT with User-Agent rewriting
/// - SOCKS5 error replies for unreachable destinations
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::broadcast;
use tokio::time::{sleep, timeout};
use uaproxy_config::{Config, Timeouts};
use uaproxy_core::run_proxy;

// Helper to create a test config
fn create_test_config(proxy_port: u16) -> Config {
    Config {
        listen_addrs: vec![format!("127.0.0.1:{}", proxy_port)],
        timeouts: Timeouts {
            connect: 2,
            sniff: 3,
            idle: 30,
        },
        ..Config::default()
    }
}

// Helper to find an available port
async fn find_available_port() -> u16 {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    addr.port()
}

// Helper to wait for server to be ready
async fn connect_with_retry(addr: &str, max_attempts: u32) -> TcpStream {
    for _ in 0..max_attempts {
        if let Ok(stream) = TcpStream::connect(addr).await {
            return stream;
        }
        sleep(Duration::from_millis(100)).await;
    }
    panic!("Proxy never started listening on {}", addr);
}

// Performs the no-auth greeting and a CONNECT to 127.0.0.1:port, returning
// the reply code
async fn socks5_connect(stream: &mut TcpStream, port: u16) -> u8 {
    stream.write_all(&[0x05, 0x01, 0x00]).await.unwrap();
    let mut choice = [0u8; 2];
    stream.read_exact(&mut choice).await.unwrap();
    assert_eq!(choice, [0x05, 0x00]);

    let mut request = vec![0x05, 0x01, 0x00, 0x01, 127, 0, 0, 1];
    request.extend_from_slice(&port.to_be_bytes());
    stream.write_all(&request).await.unwrap();

    let mut reply = [0u8; 10];
    stream.read_exact(&mut reply).await.unwrap();
    assert_eq!(reply[0], 0x05);
    reply[1]
}

async fn start_proxy(config: Config) -> broadcast::Sender<()> {
    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
    tokio::spawn(async move {
        let registry = Registry::new();
        let _ = run_proxy(config, Some(registry), shutdown_rx).await;
    });
    shutdown_tx
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_socks5_http_request_is_rewritten() {
    let backend = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let backend_port = backend.local_addr().unwrap().port();
    let backend_task = tokio::spawn(async move {
        let (mut socket, _) = backend.accept().await.unwrap();
        let mut head = Vec::new();
        while !head.ends_with(b"\r\n\r\n") {
            head.push(socket.read_u8().await.unwrap());
        }
        socket
            .write_all(b"HTTP/1.1 200 OK\r\nContent-Length: 2\r\n\r\nok")
            .await
            .unwrap();
        head
    });

    let proxy_port = find_available_port().await;
    let shutdown = start_proxy(create_test_config(proxy_port)).await;

    let mut client = connect_with_retry(&format!("127.0.0.1:{}", proxy_port), 30).await;
    assert_eq!(socks5_connect(&mut client, backend_port).await, 0x00);

    client
        .write_all(b"GET / HTTP/1.1\r\nHost: 127.0.0.1\r\nUser-Agent: curl/8.4.0\r\n\r\n")
        .await
        .unwrap();

    let head = timeout(Duration::from_secs(5), backend_task)
        .await
        .expect("backend never saw the request")
        .unwrap();
    assert_eq!(
        head,
        b"GET / HTTP/1.1\r\nHost: 127.0.0.1\r\nUser-Agent: FFF       \r\n\r\n"
    );

    let mut response = vec![0u8; 40];
    timeout(Duration::from_secs(5), client.read_exact(&mut response))
        .await
        .unwrap()
        .unwrap();
    assert!(response.ends_with(b"\r\n\r\nok"));

    let _ = shutdown.send(());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_socks5_refused_destination() {
    // Grab a port and release it so nothing listens there
    let closed_port = find_available_port().await;

    let proxy_port = find_available_port().await;
    let shutdown = start_proxy(create_test_config(proxy_port)).await;

    let mut client = connect_with_retry(&format!("127.0.0.1:{}", proxy_port), 30).await;
    let code = timeout(Duration::from_secs(5), socks5_connect(&mut client, closed_port))
        .await
        .unwrap();
    assert_eq!(code, 0x05);

    let _ = shutdown.send(());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn test_proxy_graceful_shutdown() {
    let proxy_port = find_available_port().await;
    let (shutdown_tx, shutdown_rx) = broadcast::channel::<()>(1);
    let config = create_test_config(proxy_port);
    let proxy_handle = tokio::spawn(async move { run_proxy(config, None, shutdown_rx).await.is_ok() });

    let _conn = connect_with_retry(&format!("127.0.0.1:{}", proxy_port), 30).await;
    shutdown_tx.send(()).unwrap();

    let clean = timeout(Duration::from_secs(5), proxy_handle)
        .await
        .expect("proxy did not stop")
        .unwrap();
    assert!(clean);
}
