use std::hint::black_box;
use std::sync::Arc;
use std::time::Duration;

use criterion::{criterion_group, criterion_main, Criterion};
use studyboard_collab::broadcast::{BroadcastGroup, Frame};
use studyboard_collab::presence::{AwarenessMessage, CursorColor, Identity, PresenceChannel, Vec2};
use studyboard_collab::protocol::SyncMessage;
use studyboard_collab::transport::Backoff;
use uuid::Uuid;

fn bench_delta_encode(c: &mut Criterion) {
    let peer = Uuid::new_v4();
    let delta = vec![0u8; 64];

    c.bench_function("delta_encode_64B", |b| {
        b.iter(|| {
            let msg = SyncMessage::delta(black_box(peer), black_box(1), black_box(delta.clone()));
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_delta_decode(c: &mut Criterion) {
    let msg = SyncMessage::delta(Uuid::new_v4(), 1, vec![0u8; 64]);
    let encoded = msg.encode().unwrap();

    c.bench_function("delta_decode_64B", |b| {
        b.iter(|| {
            black_box(SyncMessage::decode(black_box(&encoded)).unwrap());
        })
    });
}

fn bench_awareness_encode(c: &mut Criterion) {
    let peer = Uuid::new_v4();
    let update = AwarenessMessage::Update {
        client_id: peer,
        identity: Identity::new("Ada", CursorColor::from_uuid(peer)),
        cursor: Some(Vec2::new(640.0, 360.0)),
        clock: 1,
    };

    c.bench_function("awareness_encode", |b| {
        b.iter(|| {
            let msg = SyncMessage::awareness(peer, 1, black_box(&update)).unwrap();
            black_box(msg.encode().unwrap());
        })
    });
}

fn bench_broadcast_1000_messages(c: &mut Criterion) {
    let rt = tokio::runtime::Runtime::new().unwrap();

    c.bench_function("broadcast_1000_msgs_100_peers", |b| {
        b.iter(|| {
            rt.block_on(async {
                let group = BroadcastGroup::new(2048);
                let mut receivers = Vec::new();
                for _ in 0..100 {
                    receivers.push(group.add_peer(Uuid::new_v4()).await);
                }

                let sender = Uuid::new_v4();
                for i in 0..1000u64 {
                    let frame = Frame {
                        sender,
                        bytes: vec![i as u8; 64],
                    };
                    group.broadcast_raw(black_box(Arc::new(frame)));
                }
            });
        })
    });
}

fn bench_presence_handle_cursor(c: &mut Criterion) {
    let local_id = Uuid::new_v4();
    let remote_id = Uuid::new_v4();
    let identity = Identity::for_client("Remote", remote_id);

    c.bench_function("presence_handle_cursor", |b| {
        b.iter_custom(|iters| {
            let channel = PresenceChannel::new(local_id);
            let start = std::time::Instant::now();
            for i in 0..iters {
                let update = AwarenessMessage::Update {
                    client_id: remote_id,
                    identity: identity.clone(),
                    cursor: Some(Vec2::new(i as f64, i as f64 * 0.5)),
                    clock: i + 1,
                };
                channel.handle_message(&update);
            }
            start.elapsed()
        })
    });
}

fn bench_participants_100(c: &mut Criterion) {
    let channel = PresenceChannel::new(Uuid::new_v4());
    for i in 0..100 {
        let id = Uuid::new_v4();
        channel.handle_message(&AwarenessMessage::Update {
            client_id: id,
            identity: Identity::for_client(format!("Peer {i:03}"), id),
            cursor: Some(Vec2::new(i as f64, 0.0)),
            clock: 1,
        });
    }

    c.bench_function("participants_sorted_100", |b| {
        b.iter(|| black_box(channel.participants()))
    });
}

fn bench_backoff_delay(c: &mut Criterion) {
    let backoff = Backoff {
        max: Duration::from_secs(30),
        ..Backoff::default()
    };

    c.bench_function("backoff_delay_with_jitter", |b| {
        b.iter(|| black_box(backoff.delay(black_box(5))))
    });
}

criterion_group!(
    benches,
    bench_delta_encode,
    bench_delta_decode,
    bench_awareness_encode,
    bench_broadcast_1000_messages,
    bench_presence_handle_cursor,
    bench_participants_100,
    bench_backoff_delay,
);
criterion_main!(benches);
