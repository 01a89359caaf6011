// ABOUTME: Benchmark suite for segment reassembly throughput
// ABOUTME: Measures tracker completion, row encoding and message assembly across group sizes

use criterion::{BenchmarkId, Criterion, black_box, criterion_group, criterion_main};
use sms_inbound::delivery::InboundMessage;
use sms_inbound::row::{StoredRow, decode_rows};
use sms_inbound::{ReassemblyTracker, SegmentRecord, Transport};
use std::time::Duration;

fn create_group(reference: i32, count: u32) -> Vec<SegmentRecord> {
    (1..=count as i32)
        .map(|sequence| {
            SegmentRecord::builder(Transport::Gsm3gpp, vec![0x41; 140])
                .from("+15550100")
                .timestamp(1_700_000_000_000)
                .part(reference, sequence, count)
                .body("A".repeat(153))
                .build()
                .unwrap()
        })
        .collect()
}

fn bench_tracker(c: &mut Criterion) {
    let mut group = c.benchmark_group("tracker");
    group.measurement_time(Duration::from_secs(10));

    for &count in &[2u32, 4, 8, 16] {
        let segments = create_group(7, count);
        group.bench_with_input(BenchmarkId::new("in_order", count), &segments, |b, segments| {
            b.iter(|| {
                let mut tracker = ReassemblyTracker::new();
                for segment in segments {
                    black_box(tracker.on_segment_received(black_box(segment)).unwrap());
                }
            })
        });

        let reversed: Vec<_> = segments.iter().rev().cloned().collect();
        group.bench_with_input(BenchmarkId::new("reversed", count), &reversed, |b, segments| {
            b.iter(|| {
                let mut tracker = ReassemblyTracker::new();
                for segment in segments {
                    black_box(tracker.on_segment_received(black_box(segment)).unwrap());
                }
            })
        });
    }

    group.finish();
}

fn bench_interleaved_groups(c: &mut Criterion) {
    let mut group = c.benchmark_group("interleaved_groups");
    group.measurement_time(Duration::from_secs(10));

    // 64 concurrent three-part messages arriving round robin
    let groups: Vec<Vec<SegmentRecord>> = (0..64).map(|reference| create_group(reference, 3)).collect();
    let interleaved: Vec<SegmentRecord> = (0..3)
        .flat_map(|index| groups.iter().map(move |group| group[index].clone()))
        .collect();

    group.bench_function("64x3", |b| {
        b.iter(|| {
            let mut tracker = ReassemblyTracker::new();
            for segment in &interleaved {
                black_box(tracker.on_segment_received(black_box(segment)).unwrap());
            }
            tracker.len()
        })
    });

    group.finish();
}

fn bench_rows(c: &mut Criterion) {
    let mut group = c.benchmark_group("rows");
    group.measurement_time(Duration::from_secs(10));

    let segment = create_group(7, 1).remove(0);
    group.bench_function("encode", |b| {
        b.iter(|| StoredRow::from_record(1, black_box(&segment)).unwrap())
    });

    let row = StoredRow::from_record(1, &segment).unwrap();
    group.bench_function("decode", |b| b.iter(|| black_box(&row).to_record().unwrap()));

    group.finish();
}

fn bench_assembly(c: &mut Criterion) {
    let mut group = c.benchmark_group("assembly");
    group.measurement_time(Duration::from_secs(10));

    for &count in &[2u32, 8] {
        let segments = create_group(9, count);
        let key = segments[0].group_key();
        let rows: Vec<StoredRow> = segments
            .iter()
            .enumerate()
            .map(|(id, segment)| StoredRow::from_record(id as i64, segment).unwrap())
            .collect();

        group.bench_with_input(BenchmarkId::new("from_rows", count), &rows, |b, rows| {
            b.iter(|| InboundMessage::assemble(&key, decode_rows(black_box(rows.clone()))).unwrap())
        });
    }

    group.finish();
}

criterion_group!(
    benches,
    bench_tracker,
    bench_interleaved_groups,
    bench_rows,
    bench_assembly
);
criterion_main!(benches);
