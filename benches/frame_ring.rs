use criterion::{criterion_group, criterion_main, Criterion};
use kvmstream::frame::{FourCc, RawFrame};
use kvmstream::ring::FrameRing;

fn bench_producer_consumer_roundtrip(c: &mut Criterion) {
    let ring: FrameRing<RawFrame> =
        FrameRing::new(4, || RawFrame::blank(1920, 1080, 1920 * 3, FourCc::RGB24));

    c.bench_function("frame_ring_roundtrip", |b| {
        b.iter(|| {
            let idx = ring.producer_try_acquire().expect("ring should not be full in this benchmark");
            ring.write(idx, |frame| frame.sequence += 1);
            ring.producer_release(idx);

            let ridx = ring.consumer_try_acquire().expect("just-released slot must be ready");
            ring.read(ridx, |frame| std::hint::black_box(frame.sequence));
            ring.consumer_release(ridx);
        });
    });
}

criterion_group!(benches, bench_producer_consumer_roundtrip);
criterion_main!(benches);
