//! Directory and static-list introducers, alone and driving two swarms.

use std::{collections::BTreeMap, sync::Arc, time::Duration};

use dswarm_core::{
    introducer::{
        memory::{Announcement, MemoryDirectory, MemoryIntroducer},
        static_list::StaticIntroducer,
    },
    transport::{
        memory::{MemoryNetwork, MemoryTransport, MEMORY},
        tcp::TCP,
    },
    Address, BoxStream, Introducer, JoinContext, JoinOptions, PeerCandidate, PeerContext,
    PeerSink, SwarmConfig, SwarmError, SwarmEvent, SwarmNode, Topic,
};
use tokio::{
    io::{duplex, AsyncReadExt, AsyncWriteExt, DuplexStream},
    sync::mpsc,
};

fn join_ctx(
    id: &str,
    announce: bool,
    addresses: BTreeMap<String, Address>,
) -> (JoinContext, mpsc::UnboundedReceiver<PeerCandidate>) {
    let (sink, rx) = PeerSink::channel();
    let ctx = JoinContext {
        local_id: id.into(),
        options: JoinOptions { announce },
        addresses,
        sink,
    };
    (ctx, rx)
}

fn memory_address(port: u16) -> BTreeMap<String, Address> {
    BTreeMap::from([(MEMORY.to_string(), Address::new("memory", port))])
}

async fn candidate(rx: &mut mpsc::UnboundedReceiver<PeerCandidate>) -> PeerCandidate {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no candidate emitted")
        .expect("sink closed")
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(50)).await;
}

// ── Directory ─────────────────────────────────────────────────────────────────

#[tokio::test]
async fn directory_feeds_snapshot_then_live_announcements() {
    let dir = MemoryDirectory::new();
    let topic = Topic::from_name("room");
    dir.announce(
        &topic,
        Announcement { id: "early".into(), transport_type: MEMORY.into(), address: Address::new("memory", 1) },
    );

    let intro = MemoryIntroducer::new(dir.clone(), MEMORY);
    let (ctx, mut rx) = join_ctx("me", false, BTreeMap::new());
    intro.join(&topic, ctx).await;

    let first = candidate(&mut rx).await;
    assert_eq!(first.id, "early");
    assert_eq!(first.topic.as_ref(), Some(&topic));
    assert_eq!(first.transport_type.as_deref(), Some(MEMORY));
    assert_eq!(first.address, Some(Address::new("memory", 1)));

    dir.announce(
        &topic,
        Announcement { id: "late".into(), transport_type: MEMORY.into(), address: Address::new("memory", 2) },
    );
    assert_eq!(candidate(&mut rx).await.id, "late");
    // Looking up only: nothing of ours in the directory.
    assert!(dir.peers(&topic).iter().all(|a| a.id != "me"));
}

#[tokio::test]
async fn announce_needs_a_listening_transport() {
    let dir = MemoryDirectory::new();
    let topic = Topic::from_name("room");

    let silent = MemoryIntroducer::new(dir.clone(), MEMORY);
    let (ctx, _rx) = join_ctx("quiet", true, BTreeMap::new());
    silent.join(&topic, ctx).await;
    assert!(dir.peers(&topic).is_empty());

    let loud = MemoryIntroducer::new(dir.clone(), MEMORY);
    let (ctx, _rx2) = join_ctx("loud", true, memory_address(7));
    loud.join(&topic, ctx).await;
    assert_eq!(
        dir.peers(&topic),
        vec![Announcement { id: "loud".into(), transport_type: MEMORY.into(), address: Address::new("memory", 7) }]
    );
}

#[tokio::test]
async fn second_join_is_a_noop_and_leave_withdraws() {
    let dir = MemoryDirectory::new();
    let topic = Topic::from_name("room");
    let intro = MemoryIntroducer::new(dir.clone(), MEMORY);

    let (ctx, mut rx) = join_ctx("me", true, memory_address(3));
    intro.join(&topic, ctx).await;
    let (again, mut rx2) = join_ctx("me", true, memory_address(3));
    intro.join(&topic, again).await;

    // Our own record comes back on the first feed only.
    assert_eq!(candidate(&mut rx).await.id, "me");
    settle().await;
    assert!(rx2.try_recv().is_err());

    intro.leave(&topic).await;
    assert!(dir.peers(&topic).is_empty());

    // The feed is gone: later announcements are not forwarded.
    dir.announce(
        &topic,
        Announcement { id: "other".into(), transport_type: MEMORY.into(), address: Address::new("memory", 4) },
    );
    settle().await;
    assert!(rx.try_recv().is_err());

    // Unknown topics are tolerated.
    intro.leave(&Topic::from_name("never")).await;
}

// ── Static list ───────────────────────────────────────────────────────────────

#[tokio::test]
async fn static_list_emits_per_topic_with_budget() {
    let intro = StaticIntroducer::from_uris(["tcp://10.0.0.1:3282", "wrtc://hub.example/abc"])
        .with_retries(3);
    let a = Topic::from_name("a");
    let b = Topic::from_name("b");

    let (ctx, mut rx) = join_ctx("me", false, BTreeMap::new());
    intro.join(&a, ctx.clone()).await;
    intro.join(&a, ctx.clone()).await;
    intro.join(&b, ctx).await;

    let mut seen = Vec::new();
    while let Ok(c) = rx.try_recv() {
        assert_eq!(c.retries, Some(3));
        seen.push((c.id, c.topic.unwrap()));
    }
    assert_eq!(
        seen,
        vec![
            ("tcp://10.0.0.1:3282".to_string(), a.clone()),
            ("abc".to_string(), a.clone()),
            ("tcp://10.0.0.1:3282".to_string(), b.clone()),
            ("abc".to_string(), b.clone()),
        ]
    );

    // After leaving, a rejoin emits again.
    intro.leave(&a).await;
    let (ctx, mut rx) = join_ctx("me", false, BTreeMap::new());
    intro.join(&a, ctx).await;
    let again = candidate(&mut rx).await;
    assert_eq!(again.transport_type.as_deref(), Some(TCP));
}

// ── End to end ────────────────────────────────────────────────────────────────

type Accepted = (PeerContext, DuplexStream);

fn swarm(
    id: &str,
    net: &MemoryNetwork,
    dir: &MemoryDirectory,
) -> (dswarm_core::SwarmHandle, mpsc::UnboundedReceiver<Accepted>) {
    let (tx, rx) = mpsc::unbounded_channel();
    let config = SwarmConfig::new()
        .with_id(id)
        .with_transport(MEMORY, Arc::new(MemoryTransport::new(net.clone())))
        .with_introducer(Arc::new(MemoryIntroducer::new(dir.clone(), MEMORY)))
        .with_handler(move |ctx: PeerContext| -> Result<BoxStream, SwarmError> {
            let (ours, theirs) = duplex(4096);
            let _ = tx.send((ctx, theirs));
            Ok(Box::new(ours))
        });
    (SwarmNode::spawn(config), rx)
}

async fn accepted(rx: &mut mpsc::UnboundedReceiver<Accepted>) -> Accepted {
    tokio::time::timeout(Duration::from_secs(5), rx.recv())
        .await
        .expect("no application stream opened")
        .expect("handler dropped")
}

#[tokio::test]
async fn announcing_swarm_is_found_by_a_looking_one() {
    let net = MemoryNetwork::new();
    let dir = MemoryDirectory::new();
    let topic = Topic::from_name("shared-feed");

    let (a, mut a_apps) = swarm("a", &net, &dir);
    let (b, mut b_apps) = swarm("b", &net, &dir);
    a.listen(0).await.unwrap().into_result().unwrap();
    b.listen(0).await.unwrap().into_result().unwrap();

    let mut a_events = a.subscribe_events();
    a.join(&topic, JoinOptions { announce: true }).await.unwrap();
    b.join(&topic, JoinOptions::default()).await.unwrap();

    // B dials A through the directory; A sees B as an inbound peer.
    let (b_ctx, mut b_app) = accepted(&mut b_apps).await;
    assert_eq!(b_ctx.id, "a");
    assert_eq!(b_ctx.topic.as_ref(), Some(&topic));
    assert_eq!(b_ctx.transport_type.as_deref(), Some(MEMORY));

    let (a_ctx, mut a_app) = accepted(&mut a_apps).await;
    assert_eq!(a_ctx.id, "b");
    assert_eq!(a_ctx.topic, None);

    b_app.write_all(b"ping").await.unwrap();
    let mut buf = [0u8; 4];
    a_app.read_exact(&mut buf).await.unwrap();
    assert_eq!(&buf, b"ping");

    // A's own directory record was fed back to it and refused.
    loop {
        let ev = tokio::time::timeout(Duration::from_secs(5), a_events.recv())
            .await
            .expect("no self discard")
            .unwrap();
        if let SwarmEvent::Discarded { peer, .. } = ev {
            assert_eq!(peer, "a");
            break;
        }
    }

    a.close().await.unwrap();
    assert!(dir.peers(&topic).is_empty());
    b.close().await.unwrap();
}

// ── HTTP directory ────────────────────────────────────────────────────────────

#[cfg(feature = "http")]
mod http_directory {
    use super::*;
    use dswarm_core::{introducer::http::HttpIntroducer, signaling::WEBRTC};
    use serde_json::{json, Value};
    use tokio::{
        io::{AsyncBufReadExt, BufReader},
        net::TcpListener,
    };

    struct Request {
        method: String,
        path: String,
        body: String,
    }

    /// One-request-per-connection HTTP/1.1 directory: GET answers `listed`,
    /// POST answers `recorded`. Every request is reported on the receiver.
    async fn directory(listed: Value, recorded: Value) -> (String, mpsc::UnboundedReceiver<Request>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(async move {
            while let Ok((socket, _)) = listener.accept().await {
                let (tx, listed, recorded) = (tx.clone(), listed.clone(), recorded.clone());
                tokio::spawn(async move {
                    let mut reader = BufReader::new(socket);
                    let mut line = String::new();
                    reader.read_line(&mut line).await.unwrap();
                    let mut parts = line.split_whitespace();
                    let method = parts.next().unwrap_or_default().to_string();
                    let path = parts.next().unwrap_or_default().to_string();
                    let mut length = 0;
                    loop {
                        let mut header = String::new();
                        reader.read_line(&mut header).await.unwrap();
                        let header = header.trim_end();
                        if header.is_empty() {
                            break;
                        }
                        if let Some((name, value)) = header.split_once(':') {
                            if name.eq_ignore_ascii_case("content-length") {
                                length = value.trim().parse().unwrap();
                            }
                        }
                    }
                    let mut body = vec![0u8; length];
                    reader.read_exact(&mut body).await.unwrap();

                    let reply = if method == "POST" { recorded } else { listed }.to_string();
                    let _ = tx.send(Request {
                        method,
                        path,
                        body: String::from_utf8_lossy(&body).into_owned(),
                    });
                    let response = format!(
                        "HTTP/1.1 200 OK\r\ncontent-type: application/json\r\ncontent-length: {}\r\nconnection: close\r\n\r\n{reply}",
                        reply.len()
                    );
                    reader.get_mut().write_all(response.as_bytes()).await.unwrap();
                });
            }
        });
        (format!("http://{addr}"), rx)
    }

    async fn request(rx: &mut mpsc::UnboundedReceiver<Request>) -> Request {
        tokio::time::timeout(Duration::from_secs(5), rx.recv())
            .await
            .expect("directory saw no request")
            .expect("directory stopped")
    }

    #[tokio::test]
    async fn lists_and_refreshes_without_own_addresses() {
        let topic = Topic::from_name("room");
        let (server, mut requests) = directory(
            json!([
                "tcp://10.0.0.1:3282",
                "bogus://x",
                "wrtc://hub.example.org/cafe",
                "tcp://203.0.113.5:4000",
            ]),
            json!({ "tcp": "tcp://203.0.113.5:4000", "wrtc": false }),
        )
        .await;
        let intro = HttpIntroducer::new(server).with_refresh(Duration::from_millis(200));
        let addresses = BTreeMap::from([(TCP.to_string(), Address::new("0.0.0.0", 4000))]);
        let (ctx, mut rx) = join_ctx("me", true, addresses);
        intro.join(&topic, ctx.clone()).await;
        intro.join(&topic, ctx).await;

        let announce = request(&mut requests).await;
        assert_eq!(announce.method, "POST");
        assert_eq!(announce.path, format!("/{}", topic.hex()));
        let body: Value = serde_json::from_str(&announce.body).unwrap();
        assert_eq!(body, json!({ "tcp": "tcp://0.0.0.0:4000", "wrtc": false }));

        // Every lookup round re-emits the foreign peers and only those.
        for _ in 0..2 {
            let tcp = candidate(&mut rx).await;
            assert_eq!(tcp.id, "tcp://10.0.0.1:3282");
            assert_eq!(tcp.topic.as_ref(), Some(&topic));
            assert_eq!(tcp.transport_type.as_deref(), Some(TCP));
            let wrtc = candidate(&mut rx).await;
            assert_eq!(wrtc.id, "cafe");
            assert_eq!(wrtc.transport_type.as_deref(), Some(WEBRTC));
        }
        assert_eq!(request(&mut requests).await.method, "GET");

        intro.leave(&topic).await;
        settle().await;
        while rx.try_recv().is_ok() {}
        tokio::time::sleep(Duration::from_millis(600)).await;
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn lookup_only_never_posts() {
        let topic = Topic::from_name("room");
        let (server, mut requests) = directory(json!([]), json!({})).await;
        let intro = HttpIntroducer::new(server);
        let (ctx, _rx) = join_ctx("me", false, BTreeMap::new());
        intro.join(&topic, ctx).await;

        assert_eq!(request(&mut requests).await.method, "GET");
        intro.leave(&topic).await;
    }

    #[tokio::test]
    async fn unreachable_directory_only_means_no_peers() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);

        let intro =
            HttpIntroducer::new(format!("http://{addr}")).with_refresh(Duration::from_millis(100));
        let (ctx, mut rx) = join_ctx("me", true, BTreeMap::new());
        tokio::time::timeout(Duration::from_secs(5), intro.join(&Topic::from_name("room"), ctx))
            .await
            .expect("join hung on an unreachable directory");
        tokio::time::sleep(Duration::from_millis(300)).await;
        assert!(rx.try_recv().is_err());
    }
}
