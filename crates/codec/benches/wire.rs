use criterion::{Criterion, Throughput, criterion_group, criterion_main};
use ferry_codec::{
    frame::{self, FrameHeader, FrameKind},
    rma::{ControlRecord, RmaOp},
};

fn criterion_benchmark(c: &mut Criterion) {
    let record = ControlRecord {
        op: RmaOp::Put,
        region: 42,
        disp: 4096,
        count: 1 << 20,
    }
    .encode();

    let message = frame::build(FrameKind::Message, 1, 0x80, &[&record]);

    let mut wire_criterion = c.benchmark_group("wire");

    wire_criterion.throughput(Throughput::Elements(1));
    wire_criterion.bench_function("decode_frame_header", |bencher| {
        bencher.iter(|| {
            FrameHeader::decode(&message).unwrap();
        })
    });

    wire_criterion.bench_function("decode_control_record", |bencher| {
        bencher.iter(|| {
            ControlRecord::decode(&record).unwrap();
        })
    });

    wire_criterion.finish();
}

criterion_group!(benches, criterion_benchmark);
criterion_main!(benches);
