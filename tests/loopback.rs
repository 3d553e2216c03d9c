//! Async client and server over real loopback sockets.

use std::time::Duration;

use curvecp::prelude::*;
use tokio::net::UdpSocket;
use tokio::time::timeout;

const DEADLINE: Duration = Duration::from_secs(20);

async fn server() -> (CurveCpServer, tokio::sync::mpsc::Receiver<CurveCpStream>) {
    let config = CurveCpServerBuilder::new()
        .bind_addr("127.0.0.1:0".parse().unwrap())
        .server_key(Keypair::from_secret_bytes([0x77; 32]))
        .build();
    CurveCpServer::bind(config).await.unwrap()
}

fn client_config(server: &CurveCpServer) -> ClientConfig {
    CurveCpClientBuilder::new()
        .server_addr(server.local_addr())
        .server_public_key(server.public_key())
        .domain("loopback.example")
        .build()
}

#[tokio::test]
async fn test_echo_round_trip() {
    let (server, mut incoming) = server().await;
    let config = client_config(&server);

    let echo = tokio::spawn(async move {
        let mut stream = incoming.recv().await.unwrap();
        assert_eq!(stream.peer().domain, "loopback.example");
        let mut received = Vec::new();
        while let Some(bytes) = stream.read().await {
            received.extend_from_slice(&bytes);
        }
        stream.write(&received).await.unwrap();
        stream.close(true).await.unwrap();
        stream.finished().await
    });

    let run = async {
        let mut stream = CurveCpClient::connect(config).await.unwrap();
        stream.write(b"hello over curvecp").await.unwrap();
        stream.close(true).await.unwrap();

        let mut echoed = Vec::new();
        while let Some(bytes) = stream.read().await {
            echoed.extend_from_slice(&bytes);
        }
        assert_eq!(echoed, b"hello over curvecp");
        stream.join().await.unwrap();
    };
    timeout(DEADLINE, run).await.unwrap();

    let server_side = timeout(DEADLINE, echo).await.unwrap().unwrap();
    assert_eq!(server_side, Some(Resolution::Success));
    server.shutdown().await.unwrap();
}

#[tokio::test]
async fn test_failure_resolution_reaches_client() {
    let (server, mut incoming) = server().await;
    let config = client_config(&server);

    let rejecter = tokio::spawn(async move {
        let stream = incoming.recv().await.unwrap();
        stream.close(false).await.unwrap();
        stream
    });

    let mut stream = timeout(DEADLINE, CurveCpClient::connect(config))
        .await
        .unwrap()
        .unwrap();
    assert_eq!(timeout(DEADLINE, stream.read()).await.unwrap(), None);
    stream.close(true).await.unwrap();
    assert!(matches!(
        timeout(DEADLINE, stream.join()).await.unwrap(),
        Err(CurveCpError::ConnectionFailed)
    ));
    let _server_stream = rejecter.await.unwrap();
}

#[tokio::test]
async fn test_connect_times_out() {
    let silent = UdpSocket::bind("127.0.0.1:0").await.unwrap();
    let config = CurveCpClientBuilder::new()
        .server_addr(silent.local_addr().unwrap())
        .server_public_key([9; 32])
        .retry_schedule(vec![Duration::from_millis(50), Duration::from_millis(100)])
        .build();

    let result = timeout(DEADLINE, CurveCpClient::connect(config)).await.unwrap();
    assert!(matches!(
        result,
        Err(CurveCpError::Handshake(HandshakeError::Timeout))
    ));

    let mut buf = [0u8; 2048];
    let (len, _) = silent.recv_from(&mut buf).await.unwrap();
    assert_eq!(PacketKind::from_tag(&buf[..len]), Some(PacketKind::Hello));
}

#[tokio::test]
async fn test_server_requires_key() {
    let config = CurveCpServerBuilder::new()
        .bind_addr("127.0.0.1:0".parse().unwrap())
        .build();
    assert!(matches!(
        CurveCpServer::bind(config).await,
        Err(CurveCpError::Config(_))
    ));
}

#[tokio::test]
async fn test_full_backlog_rejects_with_failure() {
    let config = CurveCpServerBuilder::new()
        .bind_addr("127.0.0.1:0".parse().unwrap())
        .server_key(Keypair::from_secret_bytes([0x78; 32]))
        .accept_backlog(1)
        .build();
    let (server, _incoming) = CurveCpServer::bind(config).await.unwrap();

    let run = async {
        // Nobody accepts, so the first stream fills the backlog.
        let _queued = CurveCpClient::connect(client_config(&server)).await.unwrap();
        let mut rejected = CurveCpClient::connect(client_config(&server)).await.unwrap();
        assert_eq!(rejected.read().await, None);
        rejected.close(true).await.unwrap();
        assert_eq!(rejected.finished().await, Some(Resolution::Failure));
    };
    timeout(DEADLINE, run).await.unwrap();
    server.shutdown().await.unwrap();
}
