use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;
use tandem_sync::protocol::{Frame, RoomEvent, ServerEvent, TextUpdatePayload};
use tandem_sync::{
    ClientId, CursorSnapshot, Input, NoCaret, OpenDocument, PersistSnapshot, RemoteCursors, SyncConfig, SyncEngine,
    UserProfile,
};
use tokio::time::{Duration, Instant};

fn payload(client_id: ClientId, len: usize) -> TextUpdatePayload {
    let content = "lorem ipsum ".repeat(len / 12 + 1);
    TextUpdatePayload {
        persist_snapshot: PersistSnapshot::text_only(content.clone(), 1),
        content,
        client_id,
        timestamp: 1,
        document_id: "doc".into(),
        user_id: "u1".into(),
        user_email: "u1@example.com".into(),
        title: "Benchmark".into(),
        tags: vec!["a".into(), "b".into()],
        cursor: None,
    }
}

fn engine() -> SyncEngine {
    let mut engine = SyncEngine::new(
        ClientId::generate(),
        UserProfile::new("u1", "u1@example.com", "bench"),
        &SyncConfig::default(),
        Box::new(NoCaret),
    );
    engine.handle(
        Input::Open(OpenDocument {
            document_id: "doc".into(),
            ..OpenDocument::default()
        }),
        Instant::now(),
    );
    engine
}

fn bench_frame_encode(c: &mut Criterion) {
    let frame = Frame::Event(RoomEvent::new("doc", ServerEvent::TextUpdate(payload(ClientId::generate(), 4096))));

    c.bench_function("frame_encode_4KB", |b| {
        b.iter(|| black_box(black_box(&frame).encode().unwrap()))
    });
}

fn bench_frame_decode(c: &mut Criterion) {
    let encoded = Frame::Event(RoomEvent::new("doc", ServerEvent::TextUpdate(payload(ClientId::generate(), 4096))))
        .encode()
        .unwrap();

    c.bench_function("frame_decode_4KB", |b| {
        b.iter(|| black_box(Frame::decode(black_box(&encoded)).unwrap()))
    });
}

/// Keystrokes inside the debounce window: only the timer path is exercised.
fn bench_keystroke_batching(c: &mut Criterion) {
    c.bench_function("engine_1000_keystrokes", |b| {
        b.iter(|| {
            let mut engine = engine();
            let start = Instant::now();
            let mut text = String::new();
            for i in 0..1000u64 {
                text.push('x');
                if i % 9 == 8 {
                    text.push(' ');
                }
                black_box(engine.handle(Input::LocalEdit(text.clone()), start + Duration::from_millis(i)));
            }
        })
    });
}

/// Remote text updates from a peer: echo filtering plus adoption.
fn bench_remote_apply(c: &mut Criterion) {
    let peer = ClientId::generate();
    let events: Vec<RoomEvent> = (0..100)
        .map(|i| RoomEvent::new("doc", ServerEvent::TextUpdate(payload(peer, 256 + i))))
        .collect();

    c.bench_function("engine_apply_100_remote_updates", |b| {
        b.iter(|| {
            let mut engine = engine();
            let now = Instant::now();
            for event in &events {
                black_box(engine.handle(Input::Remote(event.clone()), now));
            }
        })
    });
}

fn bench_cursor_registry(c: &mut Criterion) {
    let peers: Vec<ClientId> = (0..100).map(|_| ClientId::generate()).collect();

    c.bench_function("remote_cursors_upsert_100_peers", |b| {
        b.iter(|| {
            let mut cursors = RemoteCursors::new(ClientId::generate());
            let now = Instant::now();
            for (i, peer) in peers.iter().enumerate() {
                cursors.upsert(
                    CursorSnapshot {
                        client_id: *peer,
                        username: "peer".into(),
                        offset: i as u64,
                        x: i as f32,
                        y: 0.0,
                        timestamp: 1,
                    },
                    now,
                );
            }
            black_box(cursors.len())
        })
    });
}

criterion_group!(
    benches,
    bench_frame_encode,
    bench_frame_decode,
    bench_keystroke_batching,
    bench_remote_apply,
    bench_cursor_registry,
);
criterion_main!(benches);
