use ping1d_core::config::EngineConfig;
use ping1d_core::device::{spawn_reader, PingDevice, Poller, Session};
use ping1d_core::protocol::{
    CommunicationChannel, Decoded, Message, MessageId, PacketParser, TcpChannel,
};
use pretty_assertions::assert_eq;
use std::io::{Read, Write};
use std::net::TcpListener;
use std::time::Duration;

fn quiet_config() -> EngineConfig {
    EngineConfig {
        configure_on_start: false,
        ..Default::default()
    }
}

#[tokio::test]
async fn test_tcp_link_drives_session() {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let addr = listener.local_addr().unwrap();

    // Fake sonar: report a distance, then capture what the host sends
    let sonar = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream
            .write_all(
                &Message::DistanceSimple {
                    distance: 3210,
                    confidence: 95,
                }
                .encode(),
            )
            .unwrap();
        let mut buf = [0u8; 64];
        let n = stream.read(&mut buf).unwrap();
        buf[..n].to_vec()
    });

    let channel = TcpChannel::connect(&addr.to_string()).unwrap();
    assert!(channel.describe().starts_with("tcp:127.0.0.1"));
    let writer = channel.try_clone().unwrap();
    let device = PingDevice::new(Box::new(writer), Duration::from_secs(1));
    let (handle, task) = Session::new(device, quiet_config())
        .with_poller(Poller::new(Vec::new()))
        .spawn();
    let reader = spawn_reader(Box::new(channel), handle.clone());

    let mut distance = 0;
    for _ in 0..200 {
        distance = handle.snapshot().await.unwrap().state.distance;
        if distance != 0 {
            break;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    assert_eq!(distance, 3210);

    assert!(handle.request(MessageId::Voltage5).await.unwrap());
    let sent = tokio::task::spawn_blocking(move || sonar.join().unwrap())
        .await
        .unwrap();
    let mut parser = PacketParser::new();
    parser.push(&sent);
    match parser.next_frame() {
        Decoded::Message(p) => assert_eq!(
            Message::from_packet(&p).unwrap(),
            Message::GeneralRequest { requested_id: 1202 }
        ),
        other => panic!("expected a request, got {:?}", other),
    }

    handle.shutdown().await;
    let device = task.await.unwrap();
    reader.await.unwrap();
    assert_eq!(device.parsed_messages(), 1);
    assert_eq!(device.parser_errors(), 0);
}
