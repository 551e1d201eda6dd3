//! Integration tests for the event loop: end-to-end phase ordering, the
//! worker pool under different capacities, sync-blocking starvation, and
//! cancellation.

use std::cell::RefCell;
use std::rc::Rc;
use std::time::{Duration, Instant};
use tempo_engine::{
    CallbackError, EventLoop, LoopState, ManualClock, RecordingSink, ScheduleError, TracingSink,
};

type Log = Rc<RefCell<Vec<String>>>;

fn new_log() -> Log {
    Rc::new(RefCell::new(Vec::new()))
}

fn push(log: &Log, entry: impl Into<String>) {
    log.borrow_mut().push(entry.into());
}

/// The full observational scenario: timers, an immediate, an external
/// completion that fans out into more work of every class, and a microtask.
///
/// Top-level code prints H, then the loop produces A, B, C, G, F, D, E:
/// registration-order timers and immediates first, then the completion
/// callback, its microtask right after it, the immediate it scheduled
/// before the zero-delay timer it scheduled, and the far timer last.
#[test]
fn test_end_to_end_total_order() {
    let clock = ManualClock::new();
    let mut el = EventLoop::with_clock(clock);
    let log = new_log();

    let a = log.clone();
    el.schedule_timer(Duration::ZERO, move |_cx| {
        push(&a, "A");
        Ok(())
    });
    let b = log.clone();
    el.schedule_immediate(move |_cx| {
        push(&b, "B");
        Ok(())
    });

    let c = log.clone();
    let source = el.completion_source(move |cx| {
        push(&c, "C");
        let d = c.clone();
        cx.schedule_timer(Duration::ZERO, move |_cx| {
            push(&d, "D");
            Ok(())
        });
        let e = c.clone();
        cx.schedule_timer(Duration::from_millis(3000), move |_cx| {
            push(&e, "E");
            Ok(())
        });
        let f = c.clone();
        cx.schedule_immediate(move |_cx| {
            push(&f, "F");
            Ok(())
        });
        let g = c.clone();
        cx.defer_microtask(move |_cx| {
            push(&g, "G");
            Ok(())
        });
        Ok(())
    });
    el.satisfy(source);

    // top-level code runs to completion before anything queued
    push(&log, "H");

    el.run();

    assert_eq!(*log.borrow(), vec!["H", "A", "B", "C", "G", "F", "D", "E"]);
    assert_eq!(el.state(), LoopState::Terminated);
}

#[test]
fn test_same_tick_timers_run_in_registration_order() {
    let mut el = EventLoop::with_clock(ManualClock::new());
    let log = new_log();

    for label in ["t1", "t2", "t3"] {
        let entry = log.clone();
        el.schedule_timer(Duration::ZERO, move |_cx| {
            push(&entry, label);
            Ok(())
        });
    }

    el.run();
    assert_eq!(*log.borrow(), vec!["t1", "t2", "t3"]);
}

#[test]
fn test_microtask_runs_between_io_callbacks() {
    let mut el = EventLoop::with_clock(ManualClock::new());
    let log = new_log();

    let first = log.clone();
    let s1 = el.completion_source(move |cx| {
        push(&first, "io1");
        let micro = first.clone();
        cx.defer_microtask(move |_cx| {
            push(&micro, "micro");
            Ok(())
        });
        Ok(())
    });
    let second = log.clone();
    let s2 = el.completion_source(move |_cx| {
        push(&second, "io2");
        Ok(())
    });
    el.satisfy(s1);
    el.satisfy(s2);

    el.run();
    // the microtask beats the already-queued second completion
    assert_eq!(*log.borrow(), vec!["io1", "micro", "io2"]);
}

#[test]
fn test_four_jobs_one_wave_with_default_capacity() {
    let mut el = EventLoop::new();
    let log = new_log();
    let start = Instant::now();

    let far = log.clone();
    el.schedule_timer(Duration::from_millis(300), move |_cx| {
        push(&far, "far-timer");
        Ok(())
    });

    // completion callbacks record elapsed time since the run started
    let completions: Rc<RefCell<Vec<Duration>>> = Rc::new(RefCell::new(Vec::new()));
    let times = completions.clone();
    let tag = log.clone();
    let source = el.completion_source(move |cx| {
        for i in 0..4 {
            let times = times.clone();
            let tag = tag.clone();
            cx.submit_blocking(Duration::from_millis(60), move |_cx| {
                times.borrow_mut().push(start.elapsed());
                push(&tag, format!("job{}", i));
                Ok(())
            })
            .expect("submit failed");
        }
        Ok(())
    });
    el.satisfy(source);

    el.run();

    let times = completions.borrow();
    assert_eq!(times.len(), 4);
    // all four ran in parallel: one wave, well before the far timer
    let min = *times.iter().min().expect("no completions");
    let max = *times.iter().max().expect("no completions");
    assert!(max - min < Duration::from_millis(100), "spread {:?}", max - min);
    assert!(max < Duration::from_millis(250), "wave took {:?}", max);
    assert_eq!(log.borrow().last().map(String::as_str), Some("far-timer"));
}

#[test]
fn test_four_jobs_serialize_with_capacity_one() {
    let mut el = EventLoop::new();
    el.set_pool_capacity(1).expect("capacity");
    let start = Instant::now();

    let completions: Rc<RefCell<Vec<Duration>>> = Rc::new(RefCell::new(Vec::new()));
    let times = completions.clone();
    let source = el.completion_source(move |cx| {
        for _ in 0..4 {
            let times = times.clone();
            cx.submit_blocking(Duration::from_millis(50), move |_cx| {
                times.borrow_mut().push(start.elapsed());
                Ok(())
            })
            .expect("submit failed");
        }
        Ok(())
    });
    el.satisfy(source);

    el.run();

    let times = completions.borrow();
    assert_eq!(times.len(), 4);
    // one slot: completions land roughly one cost apart
    for pair in times.windows(2) {
        assert!(pair[1] - pair[0] >= Duration::from_millis(25), "gap {:?}", pair[1] - pair[0]);
    }
    assert!(times[3] >= Duration::from_millis(170), "last at {:?}", times[3]);
}

/// With one slot and jobs whose serialized total exceeds the timer delay,
/// the timer interleaves between completions; when the total stays under
/// the delay, the timer runs last.
#[test]
fn test_timer_interleaves_with_serialized_jobs() {
    fn run_scenario(cost: Duration, timer_delay: Duration) -> Vec<String> {
        let mut el = EventLoop::new();
        el.set_pool_capacity(1).expect("capacity");
        let log = new_log();

        let t = log.clone();
        el.schedule_timer(timer_delay, move |_cx| {
            push(&t, "timer");
            Ok(())
        });
        let jobs = log.clone();
        let source = el.completion_source(move |cx| {
            for i in 0..4 {
                let jobs = jobs.clone();
                cx.submit_blocking(cost, move |_cx| {
                    push(&jobs, format!("job{}", i));
                    Ok(())
                })
                .expect("submit failed");
            }
            Ok(())
        });
        el.satisfy(source);

        el.run();
        let entries = log.borrow().clone();
        entries
    }

    // 4 * 40ms = 160ms < 400ms: every completion beats the timer
    let entries = run_scenario(Duration::from_millis(40), Duration::from_millis(400));
    assert_eq!(entries.last().map(String::as_str), Some("timer"));
    assert_eq!(entries.len(), 5);

    // 4 * 100ms = 400ms > 250ms: the timer lands between completions
    let entries = run_scenario(Duration::from_millis(100), Duration::from_millis(250));
    let timer_pos = entries
        .iter()
        .position(|entry| entry == "timer")
        .expect("timer never ran");
    assert!(timer_pos >= 1 && timer_pos < 4, "timer at {}: {:?}", timer_pos, entries);
}

#[test]
fn test_sync_blocking_starves_every_queue() {
    let mut el = EventLoop::new();
    let sink = Rc::new(RecordingSink::new());
    el.set_trace_sink(sink.clone());
    let log = new_log();
    let start = Instant::now();

    let t = log.clone();
    el.schedule_timer(Duration::from_millis(20), move |_cx| {
        push(&t, format!("timer@{}", start.elapsed().as_millis()));
        Ok(())
    });
    let c = log.clone();
    let source = el.completion_source(move |cx| {
        push(&c, "block-start");
        cx.submit_blocking_sync(Duration::from_millis(150));
        push(&c, "block-end");
        Ok(())
    });
    el.satisfy(source);

    el.run();

    let entries = log.borrow().clone();
    assert_eq!(entries[0], "block-start");
    assert_eq!(entries[1], "block-end");
    // the ready timer could not fire until the sync block released the loop
    let timer_at: u128 = entries[2]
        .strip_prefix("timer@")
        .expect("missing timer entry")
        .parse()
        .expect("bad timestamp");
    assert!(timer_at >= 150, "timer ran at {}ms", timer_at);

    // the sync path never offloads to the pool
    assert!(sink.events().iter().all(|event| !event.starts_with("job:")));
}

#[test]
fn test_cancelled_job_result_is_dropped() {
    let mut el = EventLoop::new();
    let log = new_log();

    let entry = log.clone();
    let source = el
        .submit_blocking(Duration::from_millis(30), move |_cx| {
            push(&entry, "never");
            Ok(())
        })
        .expect("submit failed");
    el.cancel(source.id());

    el.run();

    // the job ran to completion on its worker, but the callback was skipped
    assert!(log.borrow().is_empty());
    assert_eq!(el.state(), LoopState::Terminated);
}

#[test]
fn test_cancel_is_idempotent_across_lifecycle() {
    let mut el = EventLoop::with_clock(ManualClock::new());
    let log = new_log();

    let entry = log.clone();
    let keep = el.schedule_timer(Duration::ZERO, move |_cx| {
        push(&entry, "kept");
        Ok(())
    });
    let dropped = log.clone();
    let gone = el.schedule_immediate(move |_cx| {
        push(&dropped, "dropped");
        Ok(())
    });

    el.cancel(gone);
    el.cancel(gone);
    el.run();
    el.cancel(gone);
    el.cancel(keep); // already ran: no-op

    assert_eq!(*log.borrow(), vec!["kept"]);
}

#[test]
fn test_failing_callback_is_contained() {
    let mut el = EventLoop::with_clock(ManualClock::new());
    let sink = Rc::new(RecordingSink::new());
    el.set_trace_sink(sink.clone());
    let log = new_log();

    el.schedule_timer(Duration::ZERO, |_cx| Err(CallbackError::new("boom")));
    let after = log.clone();
    el.schedule_immediate(move |_cx| {
        push(&after, "still-runs");
        Ok(())
    });

    el.run();

    assert_eq!(*log.borrow(), vec!["still-runs"]);
    assert!(
        sink.events().iter().any(|event| event.starts_with("fail:timer#") && event.ends_with("boom")),
        "failure not reported: {:?}",
        sink.events()
    );
    assert_eq!(el.state(), LoopState::Terminated);
}

#[test]
fn test_phase_transitions_are_traced_in_order() {
    let mut el = EventLoop::with_clock(ManualClock::new());
    let sink = Rc::new(RecordingSink::new());
    el.set_trace_sink(sink.clone());

    el.schedule_timer(Duration::ZERO, |_cx| Ok(()));
    el.schedule_immediate(|_cx| Ok(()));

    el.run();

    assert_eq!(
        sink.take(),
        vec![
            "tick:1",
            "phase:timer",
            "run:timer#1",
            "phase:immediate",
            "run:immediate#2",
            "phase:io",
            "phase:immediate",
            "terminated",
        ]
    );
}

#[test]
fn test_capacity_locked_after_first_submission() {
    let mut el = EventLoop::new();
    el.set_pool_capacity(2).expect("capacity");

    el.submit_blocking(Duration::from_millis(5), |_cx| Ok(()))
        .expect("submit failed");
    assert_eq!(el.set_pool_capacity(8), Err(ScheduleError::CapacityLocked));

    el.run();
}

#[test]
fn test_jobs_from_io_callback_complete_after_near_timer_before_far_timer() {
    let mut el = EventLoop::new();
    let log = new_log();

    let far = log.clone();
    el.schedule_timer(Duration::from_millis(300), move |_cx| {
        push(&far, "far");
        Ok(())
    });
    let c = log.clone();
    let source = el.completion_source(move |cx| {
        push(&c, "io");
        let near = c.clone();
        cx.schedule_timer(Duration::ZERO, move |_cx| {
            push(&near, "near");
            Ok(())
        });
        for i in 0..4 {
            let jobs = c.clone();
            cx.submit_blocking(Duration::from_millis(50), move |_cx| {
                push(&jobs, format!("job{}", i));
                Ok(())
            })
            .expect("submit failed");
        }
        Ok(())
    });
    el.satisfy(source);

    el.run();

    let entries = log.borrow().clone();
    assert_eq!(entries.first().map(String::as_str), Some("io"));
    assert_eq!(entries.get(1).map(String::as_str), Some("near"));
    assert_eq!(entries.last().map(String::as_str), Some("far"));
    assert_eq!(entries.len(), 7);
}

#[test]
fn test_cancelled_far_timer_does_not_delay_termination() {
    let mut el = EventLoop::new();
    let log = new_log();

    let entry = log.clone();
    let far = el.schedule_timer(Duration::from_secs(30), move |_cx| {
        push(&entry, "never");
        Ok(())
    });
    let soon = log.clone();
    el.schedule_timer(Duration::from_millis(10), move |_cx| {
        push(&soon, "soon");
        Ok(())
    });
    el.cancel(far);

    let start = Instant::now();
    el.run();

    assert_eq!(*log.borrow(), vec!["soon"]);
    // the cancelled deadline must not hold the loop parked
    assert!(start.elapsed() < Duration::from_secs(2), "took {:?}", start.elapsed());
}

#[test]
fn test_tracing_sink_smoke() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();

    let mut el = EventLoop::with_clock(ManualClock::new());
    el.set_trace_sink(Rc::new(TracingSink));
    let log = new_log();

    let entry = log.clone();
    el.schedule_timer(Duration::from_millis(10), move |_cx| {
        push(&entry, "ran");
        Ok(())
    });

    el.run();
    assert_eq!(*log.borrow(), vec!["ran"]);
}
