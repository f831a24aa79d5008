// Benchmark for the message queue and Lamport clock hot paths
// Run with: cargo bench

use clocksim::clock::LogicalClock;
use clocksim::message::{MachineId, Message};
use clocksim::network::codec;
use clocksim::queue::MessageQueue;
use criterion::{criterion_group, criterion_main, Criterion};
use std::hint::black_box;

fn bench_queue_round_trip(c: &mut Criterion) {
    c.bench_function("enqueue+dequeue 10k messages", |b| {
        b.iter(|| {
            let mut queue = MessageQueue::new();
            let producer = queue.producer();
            for i in 0..10_000u64 {
                producer.enqueue(Message::new(MachineId(1), i)).unwrap();
            }
            let mut count = 0;
            while let Some(queued) = queue.dequeue_if_any() {
                black_box(queued);
                count += 1;
            }
            assert_eq!(count, 10_000);
        });
    });
}

fn bench_clock_witness(c: &mut Criterion) {
    c.bench_function("witness 10k clocks", |b| {
        b.iter(|| {
            let mut clock = LogicalClock::new();
            for m in 0..10_000u64 {
                clock.witness(black_box(m * 3)).unwrap();
            }
            clock.value()
        });
    });
}

fn bench_frame_codec(c: &mut Criterion) {
    let message = Message::new(MachineId(2), 123_456);
    c.bench_function("encode+decode frame", |b| {
        b.iter(|| codec::decode_frame(&codec::encode_frame(black_box(&message))));
    });
}

criterion_group!(benches, bench_queue_round_trip, bench_clock_witness, bench_frame_codec);
criterion_main!(benches);
