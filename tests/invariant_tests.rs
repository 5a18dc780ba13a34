//! Invariant sweeps over the slot state machine.
//!
//! Every test drives the queue through a scripted workload and checks the
//! structural invariants after each step: FIFO/slot-state consistency,
//! capacity and acquired-count ceilings, frame number monotonicity, and
//! oldest-free-buffer selection.

use flipchain::clock::ClockTime;
use flipchain::error::Error;
use flipchain::fence::{DisplayId, Fence};
use flipchain::format::Usage;
use flipchain::item::QueueBufferInput;
use flipchain::listener::ConsumerListener;
use flipchain::queue::{BufferQueue, ProducerApi, QueueSnapshot};
use flipchain::slot::BufferState;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

struct NullListener;

impl ConsumerListener for NullListener {
    fn on_frame_available(&self) {}
    fn on_buffers_released(&self) {}
    fn on_sideband_stream_changed(&self) {}
}

fn connected(controlled_by_app: bool) -> (Arc<BufferQueue>, Arc<dyn ConsumerListener>) {
    let queue = BufferQueue::new();
    let listener: Arc<dyn ConsumerListener> = Arc::new(NullListener);
    queue
        .consumer_connect(Arc::downgrade(&listener), controlled_by_app)
        .unwrap();
    queue.connect(ProducerApi::Cpu, controlled_by_app).unwrap();
    (queue, listener)
}

/// Check the structural invariants that must hold whenever the mutex is
/// released.
fn check_invariants(snap: &QueueSnapshot, max_buffer_count: usize, max_acquired: usize) {
    // The FIFO and the set of queued slots agree, one entry per slot.
    let mut queued: Vec<usize> = snap
        .slots
        .iter()
        .enumerate()
        .filter(|(_, slot)| slot.state == BufferState::Queued)
        .map(|(i, _)| i)
        .collect();
    let mut fifo = snap.fifo_slots.clone();
    queued.sort_unstable();
    fifo.sort_unstable();
    assert_eq!(fifo, queued, "FIFO does not match queued slots");

    // Capacity: slots in circulation never exceed the active maximum.
    let in_circulation = snap.count(BufferState::Dequeued)
        + snap.count(BufferState::Queued)
        + snap.count(BufferState::Acquired);
    assert!(
        in_circulation <= max_buffer_count,
        "{} slots in circulation exceeds max {}",
        in_circulation,
        max_buffer_count
    );

    // Acquired ceiling.
    assert!(snap.count(BufferState::Acquired) <= max_acquired);

    // A queued or acquired slot always holds a buffer.
    for (i, slot) in snap.slots.iter().enumerate() {
        if matches!(slot.state, BufferState::Queued | BufferState::Acquired) {
            assert!(slot.has_buffer, "slot {} is {:?} without a buffer", i, slot.state);
        }
    }
}

#[test]
fn round_trip_preserves_invariants() {
    let (queue, _listener) = connected(false);
    queue.set_async_mode(false).unwrap();
    queue.set_buffer_count(3).unwrap();

    let mut last_frame = 0;
    for i in 0..20u64 {
        let out = queue
            .dequeue_buffer(false, 64, 64, None, Usage::CPU_WRITE)
            .unwrap();
        check_invariants(&queue.snapshot(), 3, 1);

        queue.request_buffer(out.slot).unwrap();
        queue
            .queue_buffer(out.slot, QueueBufferInput::new(ClockTime::from_millis(i)))
            .unwrap();
        check_invariants(&queue.snapshot(), 3, 1);

        let item = queue.acquire_buffer(ClockTime::ZERO).unwrap();
        check_invariants(&queue.snapshot(), 3, 1);

        // Frame numbers are strictly monotonic across the run.
        assert!(item.frame_number > last_frame);
        last_frame = item.frame_number;

        queue
            .release_buffer(item.slot, item.frame_number, DisplayId::NONE, Fence::signaled())
            .unwrap();
        check_invariants(&queue.snapshot(), 3, 1);
    }
}

#[test]
fn cancel_and_drop_paths_preserve_invariants() {
    let (queue, _listener) = connected(true); // droppable frames
    queue.set_async_mode(false).unwrap();
    queue.set_buffer_count(3).unwrap();

    for i in 0..10u64 {
        let out = queue
            .dequeue_buffer(false, 64, 64, None, Usage::CPU_WRITE)
            .unwrap();
        check_invariants(&queue.snapshot(), 3, 1);

        if i % 3 == 0 {
            queue.cancel_buffer(out.slot, Fence::no_fence()).unwrap();
        } else {
            queue.request_buffer(out.slot).unwrap();
            queue
                .queue_buffer(out.slot, QueueBufferInput::new(ClockTime::from_millis(i)))
                .unwrap();
        }
        check_invariants(&queue.snapshot(), 3, 1);

        if i % 4 == 0 {
            if let Ok(item) = queue.acquire_buffer(ClockTime::ZERO) {
                check_invariants(&queue.snapshot(), 3, 1);
                queue
                    .release_buffer(
                        item.slot,
                        item.frame_number,
                        DisplayId::NONE,
                        Fence::signaled(),
                    )
                    .unwrap();
            }
        }
        check_invariants(&queue.snapshot(), 3, 1);
    }
}

#[test]
fn oldest_free_buffer_is_selected() {
    let (queue, _listener) = connected(false);
    queue.set_async_mode(false).unwrap();
    queue.set_buffer_count(4).unwrap();

    // Queue three frames, then drain them so three slots sit free with
    // distinct frame numbers.
    let mut slots = Vec::new();
    for i in 0..3u64 {
        let out = queue
            .dequeue_buffer(false, 64, 64, None, Usage::CPU_WRITE)
            .unwrap();
        queue.request_buffer(out.slot).unwrap();
        queue
            .queue_buffer(out.slot, QueueBufferInput::new(ClockTime::from_millis(i)))
            .unwrap();
        slots.push(out.slot);
    }
    for _ in 0..3 {
        let item = queue.acquire_buffer(ClockTime::ZERO).unwrap();
        queue
            .release_buffer(item.slot, item.frame_number, DisplayId::NONE, Fence::signaled())
            .unwrap();
    }

    // Free slots now carry frames 1, 2, 3: the oldest must win.
    let out = queue
        .dequeue_buffer(false, 64, 64, None, Usage::CPU_WRITE)
        .unwrap();
    assert_eq!(out.slot, slots[0]);
    queue.request_buffer(out.slot).unwrap();
    queue
        .queue_buffer(out.slot, QueueBufferInput::new(ClockTime::ZERO))
        .unwrap();

    // With frame 1 requeued, the free minimum moves to frame 2.
    let out = queue
        .dequeue_buffer(false, 64, 64, None, Usage::CPU_WRITE)
        .unwrap();
    assert_eq!(out.slot, slots[1]);
}

#[test]
fn producer_consumer_threads_deliver_in_order() {
    let (queue, _listener) = connected(false);
    queue.set_async_mode(false).unwrap();
    queue.set_buffer_count(3).unwrap();

    const FRAMES: u64 = 100;

    let producer_queue = queue.clone();
    let producer = thread::spawn(move || {
        for i in 0..FRAMES {
            let out = loop {
                match producer_queue.dequeue_buffer(false, 64, 64, None, Usage::CPU_WRITE) {
                    Ok(out) => break out,
                    // Transient flow-control pushback; the consumer will
                    // catch up.
                    Err(Error::MinUndequeuedViolated { .. }) => {
                        thread::sleep(Duration::from_millis(1))
                    }
                    Err(e) => panic!("dequeue failed: {}", e),
                }
            };
            producer_queue.request_buffer(out.slot).unwrap();
            producer_queue
                .queue_buffer(out.slot, QueueBufferInput::new(ClockTime::from_millis(i)))
                .unwrap();
        }
    });

    let consumer = thread::spawn(move || {
        let mut expected_frame = 1;
        while expected_frame <= FRAMES {
            let item = match queue.acquire_buffer(ClockTime::ZERO) {
                Ok(item) => item,
                Err(Error::NoBufferAvailable) => {
                    thread::sleep(Duration::from_millis(1));
                    continue;
                }
                Err(e) => panic!("acquire failed: {}", e),
            };
            // Synchronous frames are never dropped: strict FIFO order.
            assert_eq!(item.frame_number, expected_frame);
            expected_frame += 1;
            queue
                .release_buffer(item.slot, item.frame_number, DisplayId::NONE, Fence::signaled())
                .unwrap();
        }
    });

    producer.join().unwrap();
    consumer.join().unwrap();
}

#[test]
fn dropping_producer_never_stalls_and_frames_stay_fresh() {
    let (queue, _listener) = connected(true); // cannot-block, droppable
    queue.set_async_mode(false).unwrap();
    queue.set_buffer_count(3).unwrap();

    const FRAMES: u64 = 200;

    let producer_done = Arc::new(std::sync::atomic::AtomicBool::new(false));

    let producer_queue = queue.clone();
    let done_flag = producer_done.clone();
    let producer = thread::spawn(move || {
        for i in 0..FRAMES {
            let out = loop {
                match producer_queue.dequeue_buffer(false, 64, 64, None, Usage::CPU_WRITE) {
                    Ok(out) => break out,
                    Err(Error::WouldBlock) | Err(Error::MinUndequeuedViolated { .. }) => {
                        thread::sleep(Duration::from_micros(200))
                    }
                    Err(e) => panic!("dequeue failed: {}", e),
                }
            };
            producer_queue.request_buffer(out.slot).unwrap();
            producer_queue
                .queue_buffer(out.slot, QueueBufferInput::new(ClockTime::from_millis(i)))
                .unwrap();
        }
        done_flag.store(true, std::sync::atomic::Ordering::SeqCst);
    });

    let consumer_queue = queue.clone();
    let consumer = thread::spawn(move || {
        let mut last_frame = 0;
        let mut seen = 0u64;
        loop {
            let item = match consumer_queue.acquire_buffer(ClockTime::ZERO) {
                Ok(item) => item,
                Err(Error::NoBufferAvailable) => {
                    if producer_done.load(std::sync::atomic::Ordering::SeqCst) {
                        break;
                    }
                    thread::sleep(Duration::from_micros(500));
                    continue;
                }
                Err(e) => panic!("acquire failed: {}", e),
            };
            // Dropped frames may skip numbers but never go backwards.
            assert!(item.frame_number > last_frame);
            last_frame = item.frame_number;
            seen += 1;
            consumer_queue
                .release_buffer(item.slot, item.frame_number, DisplayId::NONE, Fence::signaled())
                .unwrap();
        }
        seen
    });

    producer.join().unwrap();
    let seen = consumer.join().unwrap();
    assert!(seen > 0, "consumer never saw a frame");

    check_invariants(&queue.snapshot(), 3, 1);
}
