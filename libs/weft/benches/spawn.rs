// Copyright 2025 Jonas Kruckenberg
//
// Licensed under the Apache License, Version 2.0, <LICENSE-APACHE or
// http://apache.org/licenses/LICENSE-2.0> or the MIT license <LICENSE-MIT or
// http://opensource.org/licenses/MIT>, at your option. This file may not be
// copied, modified, or distributed except according to those terms.

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use criterion::{Criterion, criterion_group, criterion_main};
use weft::coro::spawn_value;
use weft::executor::{ScalingBagExecutor, ScalingConfig, SingleThreadExecutor};

fn enqueue_single_thread(c: &mut Criterion) {
    c.bench_function("enqueue/single-thread/10k", |b| {
        b.iter(|| {
            let counter = Arc::new(AtomicUsize::new(0));
            let exec = SingleThreadExecutor::new();
            for _ in 0..10_000 {
                let counter = counter.clone();
                exec.handle().enqueue(move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                });
            }
            drop(exec);
            assert_eq!(counter.load(Ordering::Relaxed), 10_000);
        });
    });
}

fn enqueue_scaling_bag(c: &mut Criterion) {
    c.bench_function("enqueue/scaling-bag/10k", |b| {
        b.iter(|| {
            let counter = Arc::new(AtomicUsize::new(0));
            let exec =
                ScalingBagExecutor::new(ScalingConfig::new(1, 6, Duration::from_millis(1000)));
            for _ in 0..10_000 {
                let counter = counter.clone();
                exec.handle().enqueue(move || {
                    counter.fetch_add(1, Ordering::Relaxed);
                });
            }
            drop(exec);
            assert_eq!(counter.load(Ordering::Relaxed), 10_000);
        });
    });
}

fn spawn_ready_coroutines(c: &mut Criterion) {
    c.bench_function("spawn/one-shot/ready", |b| {
        b.iter(|| {
            let produced = spawn_value(async { 42_u32 });
            assert!(produced.is_ready());
        });
    });
}

criterion_group!(
    benches,
    enqueue_single_thread,
    enqueue_scaling_bag,
    spawn_ready_coroutines
);
criterion_main!(benches);
