use ccat::{CodecConfig, Session};
use criterion::{criterion_group, criterion_main, BatchSize, Criterion, Throughput};

fn bench_encode_recovery(c: &mut Criterion) {
    let mut session = Session::create(CodecConfig::default(), Box::new(|_, _| {})).unwrap();
    let payload = vec![0xABu8; 1200];
    for i in 0..64u64 {
        session.encode_original(&payload, i * 1_000).unwrap();
    }

    let mut group = c.benchmark_group("encode");
    group.throughput(Throughput::Bytes(1200 * 64));
    group.bench_function("recovery_64x1200", |b| {
        b.iter(|| session.encode_recovery().unwrap().unwrap())
    });
    group.finish();
}

fn bench_two_loss_solve(c: &mut Criterion) {
    let mut sender = Session::create(CodecConfig::default(), Box::new(|_, _| {})).unwrap();
    let payload = vec![0x5Au8; 1200];
    for i in 0..64u64 {
        sender.encode_original(&payload, i * 1_000).unwrap();
    }
    let first = sender.encode_recovery().unwrap().unwrap();
    let second = sender.encode_recovery().unwrap().unwrap();

    c.bench_function("decode/two_loss_solve_64x1200", |b| {
        b.iter_batched(
            || {
                let mut receiver =
                    Session::create(CodecConfig::default(), Box::new(|_, _| {})).unwrap();
                for i in 0..64u64 {
                    if i != 20 && i != 40 {
                        receiver.decode_original(i, &payload).unwrap();
                    }
                }
                receiver
            },
            |mut receiver| {
                receiver
                    .decode_recovery(first.sequence_start, first.count, first.row, first.data())
                    .unwrap();
                receiver
                    .decode_recovery(
                        second.sequence_start,
                        second.count,
                        second.row,
                        second.data(),
                    )
                    .unwrap();
                receiver
            },
            BatchSize::SmallInput,
        )
    });
}

criterion_group!(benches, bench_encode_recovery, bench_two_loss_solve);
criterion_main!(benches);
