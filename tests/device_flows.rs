//! End-to-end flows against an in-process stub device that speaks the
//! real wire protocol over a localhost TCP socket.

use lantuya::cipher::Cipher;
use lantuya::protocol::{self, CommandType, FrameIn, FrameOut, Version};
use lantuya::{Device, DeviceBuilder, DeviceEvent, Error, GetOptions, SetOptions};
use serde_json::{Value, json};
use std::time::Instant;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc};
use tokio::time::{Duration, sleep, timeout};

const ID: &str = "22325186db4a2217dc8e";
const KEY: &[u8] = b"4226aa407d5c1e2b";

#[derive(Debug, Clone, Copy, PartialEq)]
enum StubBehavior {
    /// Answer queries, controls, and heartbeats.
    Normal,
    /// Accept the connection but never write anything back.
    Silent,
    /// Answer everything except control frames.
    IgnoreControl,
}

/// Start a stub device on a random port. Returns the port and a tap
/// observing the DP maps of received control frames, in arrival order.
async fn spawn_stub(
    version: Version,
    behavior: StubBehavior,
) -> (u16, mpsc::UnboundedReceiver<Value>) {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let port = listener.local_addr().unwrap().port();
    let (tap_tx, tap_rx) = mpsc::unbounded_channel();

    tokio::spawn(async move {
        loop {
            let Ok((stream, _)) = listener.accept().await else {
                break;
            };
            tokio::spawn(serve(stream, version, behavior, tap_tx.clone()));
        }
    });
    (port, tap_rx)
}

async fn read_stub_frame(
    stream: &mut TcpStream,
    rbuf: &mut Vec<u8>,
    cipher: &Cipher,
) -> Option<FrameIn> {
    loop {
        if let Ok(Some(total)) = protocol::frame_len(rbuf)
            && rbuf.len() >= total
        {
            let bytes: Vec<u8> = rbuf.drain(..total).collect();
            let mut frames = protocol::decode(cipher, &bytes).ok()?;
            if frames.is_empty() {
                return None;
            }
            return Some(frames.remove(0));
        }
        let n = stream.read_buf(rbuf).await.ok()?;
        if n == 0 {
            return None;
        }
    }
}

async fn serve(
    mut stream: TcpStream,
    version: Version,
    behavior: StubBehavior,
    tap: mpsc::UnboundedSender<Value>,
) {
    let mut cipher = Cipher::new(KEY, version).unwrap();
    let mut rbuf = Vec::new();
    let mut state = json!({"1": true, "2": 0});

    while let Some(frame) = read_stub_frame(&mut stream, &mut rbuf, &cipher).await {
        if behavior == StubBehavior::Silent {
            continue;
        }
        match frame.command_type() {
            Some(CommandType::SessKeyNegStart) => {
                let Some(local_nonce) = frame.payload.as_bytes().map(<[u8]>::to_vec) else {
                    return;
                };
                if local_nonce.len() != 16 {
                    return;
                }
                let remote_nonce = [0x42u8; 16];
                let mut body = remote_nonce.to_vec();
                body.extend_from_slice(&cipher.hmac_local(&local_nonce));
                let res = protocol::encode(
                    &cipher,
                    &FrameOut {
                        seq: 100,
                        command: CommandType::SessKeyNegRes,
                        payload: &body,
                        encrypted: true,
                    },
                )
                .unwrap();
                if stream.write_all(&res).await.is_err() {
                    return;
                }

                let Some(finish) = read_stub_frame(&mut stream, &mut rbuf, &cipher).await else {
                    return;
                };
                if finish.command != CommandType::SessKeyNegFinish as u32 {
                    return;
                }
                // The client re-syncs its counter to our reply.
                if finish.seq != 100 {
                    return;
                }
                let Some(proof) = finish.payload.as_bytes() else {
                    return;
                };
                if proof != &cipher.hmac_local(&remote_nonce)[..] {
                    return;
                }

                let mut xored = [0u8; 16];
                for (i, b) in xored.iter_mut().enumerate() {
                    *b = local_nonce[i] ^ remote_nonce[i];
                }
                let session_key: [u8; 16] = match version {
                    Version::V3_5 => cipher.encrypt_gcm(&xored, &local_nonce[..12], &[]).unwrap()
                        [12..28]
                        .try_into()
                        .unwrap(),
                    _ => cipher
                        .encrypt_ecb(&xored, false)
                        .unwrap()
                        .try_into()
                        .unwrap(),
                };
                cipher.set_session_key(session_key);
            }
            Some(command @ (CommandType::DpQuery | CommandType::DpQueryNew)) => {
                let payload = serde_json::to_vec(&json!({"devId": ID, "dps": state})).unwrap();
                let res = protocol::encode(
                    &cipher,
                    &FrameOut {
                        seq: frame.seq,
                        command,
                        payload: &payload,
                        encrypted: false,
                    },
                )
                .unwrap();
                let _ = stream.write_all(&res).await;
            }
            Some(CommandType::Control | CommandType::ControlNew) => {
                let dps = frame
                    .payload
                    .as_json()
                    .and_then(|v| v.get("dps"))
                    .cloned()
                    .unwrap_or(Value::Null);
                let _ = tap.send(dps.clone());
                if behavior == StubBehavior::IgnoreControl {
                    continue;
                }
                if let (Some(map), Some(new)) = (state.as_object_mut(), dps.as_object()) {
                    for (k, v) in new {
                        map.insert(k.clone(), v.clone());
                    }
                }
                let payload = serde_json::to_vec(&json!({"dps": dps, "t": 1700000000u64})).unwrap();
                let res = protocol::encode(
                    &cipher,
                    &FrameOut {
                        seq: 0,
                        command: CommandType::Status,
                        payload: &payload,
                        encrypted: false,
                    },
                )
                .unwrap();
                let _ = stream.write_all(&res).await;
            }
            Some(CommandType::HeartBeat) => {
                let res = protocol::encode(
                    &cipher,
                    &FrameOut {
                        seq: frame.seq,
                        command: CommandType::HeartBeat,
                        payload: &[],
                        encrypted: false,
                    },
                )
                .unwrap();
                let _ = stream.write_all(&res).await;
            }
            _ => {}
        }
    }
}

fn device_for(port: u16, version: Version) -> Device {
    DeviceBuilder::new()
        .id(ID)
        .key(KEY)
        .ip("127.0.0.1")
        .port(port)
        .version(version)
        .issue_get_on_connect(false)
        .build()
        .unwrap()
}

async fn expect_event<F>(rx: &mut broadcast::Receiver<DeviceEvent>, mut pred: F) -> DeviceEvent
where
    F: FnMut(&DeviceEvent) -> bool,
{
    timeout(Duration::from_secs(5), async {
        loop {
            let event = rx.recv().await.expect("event channel closed");
            if pred(&event) {
                return event;
            }
        }
    })
    .await
    .expect("expected event did not arrive")
}

#[tokio::test]
async fn get_round_trips_v33() {
    let (port, _tap) = spawn_stub(Version::V3_3, StubBehavior::Normal).await;
    let device = device_for(port, Version::V3_3);

    assert_eq!(device.get(GetOptions::default()).await.unwrap(), json!(true));
    let schema = device
        .get(GetOptions {
            schema: true,
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(schema["dps"], json!({"1": true, "2": 0}));
    assert!(device.is_connected());
}

#[tokio::test]
async fn set_resolves_on_status_and_emits_data() {
    let (port, _tap) = spawn_stub(Version::V3_3, StubBehavior::Normal).await;
    let device = device_for(port, Version::V3_3);
    let mut events = device.subscribe();

    let reply = device
        .set(SetOptions {
            dps: Some(1),
            set: Some(json!(false)),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(reply["dps"], json!({"1": false}));

    expect_event(&mut events, |e| matches!(e, DeviceEvent::Connected)).await;
    let data = expect_event(&mut events, |e| matches!(e, DeviceEvent::Data { .. })).await;
    let DeviceEvent::Data { payload, .. } = data else {
        unreachable!()
    };
    assert_eq!(payload["dps"]["1"], json!(false));
}

#[tokio::test]
async fn sets_arrive_in_issue_order() {
    let (port, mut tap) = spawn_stub(Version::V3_3, StubBehavior::Normal).await;
    let device = device_for(port, Version::V3_3);
    device.connect().await.unwrap();

    let first = device.set(SetOptions {
        dps: Some(1),
        set: Some(json!(false)),
        ..Default::default()
    });
    let second = device.set(SetOptions {
        dps: Some(2),
        set: Some(json!(7)),
        ..Default::default()
    });
    let (a, b) = tokio::join!(first, second);
    a.unwrap();
    b.unwrap();

    let seen_first = tap.recv().await.unwrap();
    let seen_second = tap.recv().await.unwrap();
    assert!(seen_first.get("1").is_some());
    assert!(seen_second.get("2").is_some());
}

#[tokio::test]
async fn toggle_is_an_involution() {
    let (port, _tap) = spawn_stub(Version::V3_3, StubBehavior::Normal).await;
    let device = device_for(port, Version::V3_3);

    let flipped = device.toggle(1).await.unwrap();
    assert!(!flipped);
    let back = device.toggle(1).await.unwrap();
    assert!(back);
}

#[tokio::test]
async fn set_times_out_and_session_survives() {
    let (port, _tap) = spawn_stub(Version::V3_3, StubBehavior::IgnoreControl).await;
    let device = DeviceBuilder::new()
        .id(ID)
        .key(KEY)
        .ip("127.0.0.1")
        .port(port)
        .version(Version::V3_3)
        .issue_get_on_connect(false)
        .response_timeout(Duration::from_secs(1))
        .build()
        .unwrap();

    let started = Instant::now();
    let result = device
        .set(SetOptions {
            dps: Some(1),
            set: Some(json!(false)),
            ..Default::default()
        })
        .await;
    assert_eq!(result, Err(Error::SetTimeout));
    assert!(started.elapsed() < Duration::from_secs(4));

    // The connection is still up and serving queries.
    assert!(device.is_connected());
    assert_eq!(device.get(GetOptions::default()).await.unwrap(), json!(true));
}

#[tokio::test]
async fn disconnect_fails_inflight_set() {
    let (port, _tap) = spawn_stub(Version::V3_3, StubBehavior::Silent).await;
    let device = device_for(port, Version::V3_3);
    device.connect().await.unwrap();

    let worker = {
        let device = device.clone();
        tokio::spawn(async move {
            device
                .set(SetOptions {
                    dps: Some(1),
                    set: Some(json!(false)),
                    ..Default::default()
                })
                .await
        })
    };
    sleep(Duration::from_millis(300)).await;
    device.disconnect().await.unwrap();

    assert_eq!(worker.await.unwrap(), Err(Error::Disconnected));
    assert!(!device.is_connected());
}

#[tokio::test]
async fn unanswered_heartbeats_disconnect() {
    let (port, _tap) = spawn_stub(Version::V3_3, StubBehavior::Silent).await;
    let device = DeviceBuilder::new()
        .id(ID)
        .key(KEY)
        .ip("127.0.0.1")
        .port(port)
        .version(Version::V3_3)
        .issue_get_on_connect(false)
        .heartbeat_period(Duration::from_millis(500))
        .response_timeout(Duration::from_secs(2))
        .build()
        .unwrap();

    let mut events = device.subscribe();
    device.connect().await.unwrap();

    let started = Instant::now();
    expect_event(&mut events, |e| matches!(e, DeviceEvent::Disconnected)).await;
    // First ping at ~0.5 s, liveness window armed one period later,
    // expiring two seconds after that.
    assert!(started.elapsed() < Duration::from_millis(4500));
    assert!(!device.is_connected());
}

#[tokio::test]
async fn discovery_resolves_ip_from_broadcast() {
    // Nothing is broadcasting yet: a short find must time out, and both
    // listener sockets must come back down for the next attempt.
    let quick = lantuya::Discovery::new().with_timeout(Duration::from_millis(300));
    assert_eq!(
        quick
            .find(lantuya::FindQuery::Id("0000000000"), None)
            .await
            .err(),
        Some(Error::FindTimeout)
    );

    // Periodic announcer on the plaintext broadcast port.
    let announcer = tokio::spawn(async {
        let socket = tokio::net::UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let payload = serde_json::to_vec(&json!({
            "gwId": ID,
            "ip": "127.0.0.1",
            "version": "3.3",
            "productKey": "keyjct8v5mrqkaq7"
        }))
        .unwrap();
        loop {
            let _ = socket.send_to(&payload, "127.0.0.1:6666").await;
            sleep(Duration::from_millis(150)).await;
        }
    });

    let device = DeviceBuilder::new().id(ID).key(KEY).build().unwrap();
    let found = device.find().await.unwrap();
    assert_eq!(found.ip, "127.0.0.1");
    assert_eq!(device.ip().as_deref(), Some("127.0.0.1"));
    assert_eq!(device.version(), Version::V3_3);

    let all = lantuya::Discovery::new()
        .with_timeout(Duration::from_secs(1))
        .find_all()
        .await
        .unwrap();
    assert!(all.iter().any(|d| d.id == ID && d.ip == "127.0.0.1"));

    announcer.abort();
}

#[tokio::test]
async fn v34_handshake_and_query() {
    let (port, _tap) = spawn_stub(Version::V3_4, StubBehavior::Normal).await;
    let device = device_for(port, Version::V3_4);

    device.connect().await.unwrap();
    assert!(device.is_connected());
    assert_eq!(device.get(GetOptions::default()).await.unwrap(), json!(true));

    let reply = device
        .set(SetOptions {
            dps: Some(1),
            set: Some(json!(false)),
            ..Default::default()
        })
        .await
        .unwrap();
    assert_eq!(reply["dps"]["1"], json!(false));
}
