/*
Handoff cost of the prefetch mailbox and the tick gate.
The mailbox case runs a real producer thread, so each iteration is one
full take plus the producer refilling the slot.
*/

use criterion::{Criterion, criterion_group, criterion_main};
use std::{hint::black_box, thread, time::Duration};

use sitl_bridge::sync::{SimGate, mailbox};

fn bench_mailbox_handoff(c: &mut Criterion) {
    let mut group = c.benchmark_group("mailbox");

    group.bench_function("take_prefetched", |b| {
        let (producer, consumer) = mailbox::<u64>();
        let worker = thread::spawn(move || {
            let mut n = 0u64;
            while producer.wait_empty() {
                n += 1;
                if !producer.put(n) {
                    break;
                }
            }
        });

        b.iter(|| black_box(consumer.take_timeout(Duration::from_secs(1))));

        //dropping the consumer unblocks and ends the producer
        drop(consumer);
        let _ = worker.join();
    });

    group.finish();
}

fn bench_gate(c: &mut Criterion) {
    let mut group = c.benchmark_group("sim_gate");

    group.bench_function("release_acquire", |b| {
        let gate = SimGate::new();
        b.iter(|| {
            gate.release();
            black_box(gate.try_acquire())
        });
    });

    group.bench_function("acquire_empty", |b| {
        let gate = SimGate::new();
        b.iter(|| black_box(gate.try_acquire()));
    });

    group.finish();
}

criterion_group!(benches, bench_mailbox_handoff, bench_gate);
criterion_main!(benches);
