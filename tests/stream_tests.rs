//! End-to-end tests against a live gateway on a loopback socket.

use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::oneshot;
use tokio::time::timeout;
use turret_gateway::serial::MemoryLink;
use turret_gateway::{
    CaptureSettings, FrameSlot, Gateway, GatewayConfig, MockActuators, SerialChannel,
    TestPatternOpener,
};

fn test_config() -> GatewayConfig {
    let mut config = GatewayConfig::default();
    config.capture = CaptureSettings::default()
        .with_resolution(64, 48)
        .with_fps(30);
    config
}

fn find(haystack: &[u8], needle: &[u8]) -> Option<usize> {
    haystack
        .windows(needle.len())
        .position(|window| window == needle)
}

/// Wait until `slot` has exactly `expected` parked viewers. With `stable`,
/// the count must hold for several consecutive samples spanning more than
/// one frame interval.
async fn wait_for_viewers(slot: &FrameSlot, expected: usize, stable: bool) -> bool {
    let required = if stable { 8 } else { 1 };
    let mut streak = 0;
    let deadline = tokio::time::Instant::now() + Duration::from_secs(3);
    while tokio::time::Instant::now() < deadline {
        if slot.waiter_count() == expected {
            streak += 1;
            if streak >= required {
                return true;
            }
        } else {
            streak = 0;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    false
}

/// Read from `stream` until one complete multipart part is buffered and
/// return its JPEG payload.
async fn read_first_part(stream: &mut TcpStream, received: &mut Vec<u8>) -> Vec<u8> {
    let marker = b"--FRAME\r\nContent-Type: image/jpeg\r\nContent-Length: ";
    let mut buf = [0u8; 4096];
    loop {
        if let Some(start) = find(received, marker) {
            let after_marker = start + marker.len();
            if let Some(eol) = find(&received[after_marker..], b"\r\n\r\n") {
                let length: usize = std::str::from_utf8(&received[after_marker..after_marker + eol])
                    .unwrap()
                    .parse()
                    .unwrap();
                let payload_start = after_marker + eol + 4;
                if received.len() >= payload_start + length + 2 {
                    assert_eq!(
                        &received[payload_start + length..payload_start + length + 2],
                        b"\r\n"
                    );
                    return received[payload_start..payload_start + length].to_vec();
                }
            }
        }
        let n = stream.read(&mut buf).await.unwrap();
        assert!(n > 0, "connection closed before a full part arrived");
        received.extend_from_slice(&buf[..n]);
    }
}

#[tokio::test]
async fn test_stream_delivers_jpeg_parts_over_tcp() {
    let link = MemoryLink::new();
    let probe = link.clone();
    let gateway = Gateway::start(
        test_config(),
        TestPatternOpener,
        SerialChannel::new(Some(Box::new(link))),
        Box::new(MockActuators::unavailable()),
    )
    .unwrap();
    let slot = Arc::clone(gateway.frame_slot());

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(gateway.serve(listener, async move {
        let _ = stop_rx.await;
    }));

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(b"GET /stream.mjpg HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();

    let mut received = Vec::new();
    let jpeg = timeout(Duration::from_secs(5), read_first_part(&mut client, &mut received))
        .await
        .expect("no frame within timeout");

    let head = String::from_utf8_lossy(&received).to_ascii_lowercase();
    assert!(head.starts_with("http/1.1 200"));
    assert!(head.contains("content-type: multipart/x-mixed-replace; boundary=frame"));
    assert_eq!(&jpeg[..2], &[0xFF, 0xD8]);
    assert_eq!(&jpeg[jpeg.len() - 2..], &[0xFF, 0xD9]);

    let decoded = image::load_from_memory_with_format(&jpeg, image::ImageFormat::Jpeg).unwrap();
    assert_eq!((decoded.width(), decoded.height()), (64, 48));

    // A second part follows without another request.
    let before = slot.generation();
    let mut second = Vec::new();
    timeout(Duration::from_secs(5), read_first_part(&mut client, &mut second))
        .await
        .expect("stream stalled");
    assert!(slot.generation() > before);
    assert!(wait_for_viewers(&slot, 1, false).await);

    // The server-side stream task goes away with the client.
    drop(client);
    assert!(
        wait_for_viewers(&slot, 0, true).await,
        "stream task outlived its client"
    );

    stop_tx.send(()).unwrap();
    let served = timeout(Duration::from_secs(5), server)
        .await
        .expect("server did not shut down")
        .unwrap();
    assert!(served.is_ok());
    assert!(slot.is_closed());
    assert_eq!(probe.written_lines(), vec!["X"]);
}

#[tokio::test]
async fn test_shutdown_ends_open_streams() {
    let gateway = Gateway::start(
        test_config(),
        TestPatternOpener,
        SerialChannel::disconnected(),
        Box::new(MockActuators::unavailable()),
    )
    .unwrap();

    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (stop_tx, stop_rx) = oneshot::channel::<()>();
    let server = tokio::spawn(gateway.serve(listener, async move {
        let _ = stop_rx.await;
    }));

    let mut client = TcpStream::connect(addr).await.unwrap();
    client
        .write_all(b"GET /stream.mjpg HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .await
        .unwrap();
    let mut received = Vec::new();
    timeout(Duration::from_secs(5), read_first_part(&mut client, &mut received))
        .await
        .expect("no frame within timeout");

    // The viewer stays connected; draining must still let the server finish.
    stop_tx.send(()).unwrap();
    let served = timeout(Duration::from_secs(5), server)
        .await
        .expect("open stream blocked shutdown")
        .unwrap();
    assert!(served.is_ok());

    let mut rest = Vec::new();
    let closed = timeout(Duration::from_secs(5), client.read_to_end(&mut rest)).await;
    assert!(closed.is_ok());
}
