//! Per-record overhead benchmarking: partition routing and record framing.

use std::fmt;
use std::time::Duration;

use rss_writer::client::PartitionRouter;
use rss_writer::protocol::StreamRequest;
use rss_writer::RssError;

use bytes::Bytes;

use rand::distributions::Alphanumeric;
use rand::Rng;

use criterion::{
    black_box, criterion_group, criterion_main, BenchmarkId, Criterion,
};

use lazy_static::lazy_static;

static LAYOUTS: [(usize, usize, Option<usize>); 4] =
    [(1, 2, None), (2, 3, None), (2, 5, Some(2)), (4, 8, Some(3))];
static SIZES: [usize; 4] = [16, 256, 4096, 64 * 1024];

struct LayoutId(pub (usize, usize, Option<usize>));

impl fmt::Display for LayoutId {
    fn fmt(&self, f: &mut fmt::Formatter) -> fmt::Result {
        let (groups, size, limit) = self.0;
        match limit {
            Some(k) => write!(f, "{}x{}@{}", groups, size, k),
            None => write!(f, "{}x{}@all", groups, size),
        }
    }
}

lazy_static!(
    /// A long pre-generated value string to take record values from.
    static ref MOM_VALUE: String = rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(64 * 1024)
        .map(char::from)
        .collect();
);

fn new_router(
    layout: (usize, usize, Option<usize>),
) -> Result<PartitionRouter, RssError> {
    let (num_groups, group_size, limit) = layout;
    let groups = (0..num_groups)
        .map(|g| (g * group_size..(g + 1) * group_size).collect())
        .collect();
    PartitionRouter::new(groups, num_groups * group_size, limit)
}

fn frame_record(size: usize) -> Result<usize, RssError> {
    let req = StreamRequest::Record {
        partition: 7,
        key: None,
        value: Some(Bytes::copy_from_slice(&MOM_VALUE.as_bytes()[..size])),
    };
    let frame = rmp_serde::encode::to_vec(&req)?;
    Ok(black_box(frame.len() + 8))
}

fn route_bench_group(c: &mut Criterion) {
    let mut group = c.benchmark_group("route_bench");
    group
        .sample_size(50)
        .warm_up_time(Duration::from_millis(100))
        .measurement_time(Duration::from_secs(3));

    for layout in LAYOUTS {
        let router = match new_router(layout) {
            Ok(router) => router,
            Err(e) => panic!("invalid bench layout: {}", e),
        };
        group.bench_with_input(
            BenchmarkId::from_parameter(LayoutId(layout)),
            &router,
            |b, router| {
                let mut partition = 0;
                b.iter(|| {
                    partition = (partition + 1) % 4096;
                    black_box(router.route(partition))
                });
            },
        );
    }

    group.finish();
}

fn frame_bench_group(c: &mut Criterion) {
    let mut group = c.benchmark_group("frame_bench");
    group
        .sample_size(50)
        .warm_up_time(Duration::from_millis(100))
        .measurement_time(Duration::from_secs(3));

    for size in SIZES {
        group.bench_with_input(
            BenchmarkId::from_parameter(size),
            &size,
            |b, &size| {
                b.iter(|| frame_record(size));
            },
        );
    }

    group.finish();
}

criterion_group!(benches, route_bench_group, frame_bench_group);
criterion_main!(benches);
