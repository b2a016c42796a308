//! End-to-end scheduling scenarios: yield ordering, sleep ordering, and
//! thread creation/join, run against a real VP on its own OS thread.
//!
//! Every test spawns a fresh OS thread and calls `state_threads::init()`
//! there: the VP is thread-local, so tests can run in parallel as long as
//! none of them touch process-wide state (the key table, `RLIMIT_NOFILE`) —
//! those are marked `#[serial]` in their own test files instead.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use pretty_assertions::assert_eq;
use state_threads::{init, sleep, thread_create, thread_join, thread_self, thread_yield, StError};

fn run_on_vp<F: FnOnce() + Send + 'static>(f: F) {
    thread::spawn(f).join().unwrap();
}

#[test]
fn thread_create_and_join_returns_value() {
    run_on_vp(|| {
        init().unwrap();
        let t = thread_create(0, true, Some("worker".into()), || 7i32).unwrap();
        let retval = thread_join(t).unwrap();
        assert_eq!(*retval.downcast::<i32>().unwrap(), 7);
    });
}

#[test]
fn many_coroutines_run_to_completion() {
    run_on_vp(|| {
        init().unwrap();
        let counter = Arc::new(AtomicUsize::new(0));
        let handles: Vec<_> = (0..16)
            .map(|_| {
                let counter = counter.clone();
                thread_create(0, true, None, move || {
                    for _ in 0..4 {
                        thread_yield();
                    }
                    counter.fetch_add(1, Ordering::SeqCst);
                })
                .unwrap()
            })
            .collect();
        for h in handles {
            thread_join(h).unwrap();
        }
        assert_eq!(counter.load(Ordering::SeqCst), 16);
    });
}

#[test]
fn yield_preserves_fifo_run_order() {
    // Each coroutine yields once, then records its position. Since
    // `thread_yield` pushes to the run-queue tail, coroutines that started
    // (and thus first yielded) earlier resume earlier.
    run_on_vp(|| {
        init().unwrap();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let mut handles = Vec::new();
        for i in 0..5 {
            let order = order.clone();
            handles.push(
                thread_create(0, true, None, move || {
                    thread_yield();
                    order.lock().unwrap().push(i);
                })
                .unwrap(),
            );
        }
        for h in handles {
            thread_join(h).unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2, 3, 4]);
    });
}

#[test]
fn sleep_ordering_wakes_shortest_timeout_first() {
    // Three coroutines sleep for different durations; they must be woken
    // (and thus reap-ordered into `order`) from shortest to longest,
    // regardless of creation order, per the timeout heap's due-time
    // ordering (spec.md's heap behavior).
    run_on_vp(|| {
        init().unwrap();
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));
        let durations = [(30, std::time::Duration::from_millis(30)), (10, std::time::Duration::from_millis(10)), (20, std::time::Duration::from_millis(20))];
        let mut handles = Vec::new();
        for (tag, dur) in durations {
            let order = order.clone();
            handles.push(thread_create(0, true, None, move || {
                sleep(Some(dur)).unwrap();
                order.lock().unwrap().push(tag);
            }).unwrap());
        }
        for h in handles {
            thread_join(h).unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![10, 20, 30]);
    });
}

#[test]
fn joining_self_fails_with_deadlock() {
    run_on_vp(|| {
        init().unwrap();
        let t = thread_create(0, true, None, || {
            let me = thread_self();
            let err = thread_join(me).unwrap_err();
            assert!(matches!(err, StError::Deadlock));
        })
        .unwrap();
        thread_join(t).unwrap();
    });
}

#[test]
fn second_joiner_on_same_target_fails_with_invalid_argument() {
    run_on_vp(|| {
        init().unwrap();
        let target = thread_create(0, true, None, || {
            for _ in 0..4 {
                thread_yield();
            }
        })
        .unwrap();

        let second_result = Arc::new(std::sync::Mutex::new(None));
        let second_result2 = second_result.clone();
        let second = thread_create(0, true, None, move || {
            // Let the first joiner commit (`joining = true`) before this
            // one attempts the same target.
            thread_yield();
            thread_yield();
            *second_result2.lock().unwrap() = Some(thread_join(target).map(|_| ()));
        })
        .unwrap();

        thread_join(target).unwrap();
        thread_join(second).unwrap();

        let result = second_result.lock().unwrap().take().unwrap();
        assert!(matches!(result, Err(StError::InvalidArgument)));
    });
}

#[test]
fn non_joinable_coroutine_runs_without_a_join_handle() {
    run_on_vp(|| {
        init().unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        let _ = thread_create(0, false, None, move || {
            ran2.store(1, Ordering::SeqCst);
        })
        .unwrap();
        // Give the non-joinable coroutine a chance to run before this
        // (the primordial) coroutine exits the VP's scope.
        for _ in 0..8 {
            thread_yield();
        }
        assert_eq!(ran.load(Ordering::SeqCst), 1);
    });
}
