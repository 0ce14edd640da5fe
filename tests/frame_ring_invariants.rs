//! The frame ring preserves producer order for the consumer and never
//! hands out a slot that is simultaneously writable and readable.

use kvmstream::frame::{FourCc, RawFrame};
use kvmstream::ring::FrameRing;
use std::sync::Arc;
use std::time::Duration;

#[test]
fn frames_are_observed_in_grab_order_across_threads() {
    let ring: Arc<FrameRing<RawFrame>> =
        Arc::new(FrameRing::new(4, || RawFrame::blank(4, 4, 12, FourCc::RGB24)));

    let producer_ring = ring.clone();
    let producer = std::thread::spawn(move || {
        for seq in 0..20u64 {
            let idx = loop {
                if let Some(idx) = producer_ring.producer_try_acquire() {
                    break idx;
                }
                std::thread::sleep(Duration::from_micros(100));
            };
            producer_ring.write(idx, |frame| frame.sequence = seq);
            producer_ring.producer_release(idx);
        }
    });

    let mut observed = Vec::new();
    while observed.len() < 20 {
        if let Some(idx) = ring.consumer_try_acquire() {
            ring.read(idx, |frame| observed.push(frame.sequence));
            ring.consumer_release(idx);
        } else {
            std::thread::sleep(Duration::from_micros(100));
        }
    }

    producer.join().unwrap();
    assert_eq!(observed, (0..20).collect::<Vec<_>>());
}

#[test]
fn ring_reports_full_when_no_consumer_drains_it() {
    let ring: FrameRing<u32> = FrameRing::new(2, || 0);
    assert!(ring.producer_try_acquire().is_some());
    assert!(ring.producer_try_acquire().is_some());
    assert!(ring.producer_try_acquire().is_none());
}
