use criterion::{criterion_group, criterion_main, BenchmarkId, Criterion, Throughput};
use std::hint::black_box;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use pubsub_listener::core::ack::FlushRequests;
use pubsub_listener::core::ack::PendingAction;
use pubsub_listener::{Message, Sequencer};

fn create_messages(count: usize, keys: usize) -> Vec<Message> {
    (0..count)
        .map(|i| {
            let msg = Message::new(format!("ack-{i}"), vec![0u8; 256]);
            if keys == 0 {
                msg
            } else {
                msg.with_ordering_key(format!("key-{}", i % keys))
            }
        })
        .collect()
}

fn bench_sequencer_add_next(c: &mut Criterion) {
    let mut group = c.benchmark_group("sequencer_add_next");

    for &keys in [0usize, 1, 64].iter() {
        let size = 10_000;
        group.throughput(Throughput::Elements(size as u64));
        group.bench_with_input(BenchmarkId::new("keys", keys), &keys, |b, &keys| {
            let messages = create_messages(size, keys);
            b.iter(|| {
                let delivered = Arc::new(AtomicU64::new(0));
                let counter = Arc::clone(&delivered);
                let seq = Sequencer::new(move |_m: Message| {
                    counter.fetch_add(1, Ordering::Relaxed);
                });
                for m in &messages {
                    seq.add(m.clone());
                }
                for m in &messages {
                    let _ = seq.next(m);
                }
                black_box(delivered.load(Ordering::Relaxed))
            });
        });
    }
    group.finish();
}

fn bench_flush_request_split(c: &mut Criterion) {
    let mut group = c.benchmark_group("flush_request_build");

    for &max_bytes in [500_000usize, 10_000].iter() {
        let entries: Vec<(String, PendingAction)> = (0..20_000)
            .map(|i| {
                let action = if i % 3 == 0 {
                    PendingAction::ModifyDeadline(60)
                } else {
                    PendingAction::Ack
                };
                (format!("projects/p/ack-id-{i:08}"), action)
            })
            .collect();
        group.throughput(Throughput::Elements(entries.len() as u64));
        group.bench_with_input(
            BenchmarkId::new("max_bytes", max_bytes),
            &max_bytes,
            |b, &max_bytes| {
                b.iter(|| {
                    let reqs = FlushRequests::build(
                        "projects/p/subscriptions/s",
                        entries.iter().cloned(),
                        max_bytes,
                    );
                    black_box(reqs.len())
                });
            },
        );
    }
    group.finish();
}

criterion_group!(benches, bench_sequencer_add_next, bench_flush_request_split);
criterion_main!(benches);
