//! Mutex hand-off, timed condition-variable waits, and the signal-vs-timeout
//! race, run against a real VP.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use pretty_assertions::assert_eq;
use state_threads::{cond_new, init, mutex_new, sleep, thread_create, thread_join, thread_yield};

fn run_on_vp<F: FnOnce() + Send + 'static>(f: F) {
    thread::spawn(f).join().unwrap();
}

#[test]
fn mutex_hands_off_to_waiters_in_fifo_order() {
    run_on_vp(|| {
        init().unwrap();
        let mutex = Arc::new(mutex_new());
        let order = Arc::new(std::sync::Mutex::new(Vec::new()));

        mutex.lock().unwrap();

        let mut handles = Vec::new();
        for i in 0..3 {
            let mutex = mutex.clone();
            let order = order.clone();
            handles.push(
                thread_create(0, true, None, move || {
                    mutex.lock().unwrap();
                    order.lock().unwrap().push(i);
                    mutex.unlock().unwrap();
                })
                .unwrap(),
            );
            // Let each waiter actually register itself before the next is
            // created, so the wait queue order matches creation order.
            thread_yield();
        }

        mutex.unlock().unwrap();

        for h in handles {
            thread_join(h).unwrap();
        }
        assert_eq!(*order.lock().unwrap(), vec![0, 1, 2]);
    });
}

#[test]
fn mutex_lock_by_owner_is_deadlock() {
    run_on_vp(|| {
        init().unwrap();
        let mutex = mutex_new();
        mutex.lock().unwrap();
        let err = mutex.lock().unwrap_err();
        assert!(matches!(err, state_threads::StError::Deadlock));
    });
}

#[test]
fn unlock_by_non_owner_is_permission_denied() {
    run_on_vp(|| {
        init().unwrap();
        let mutex = Arc::new(mutex_new());
        let mutex2 = mutex.clone();
        let t = thread_create(0, true, None, move || {
            let err = mutex2.unlock().unwrap_err();
            assert!(matches!(err, state_threads::StError::PermissionDenied));
        })
        .unwrap();
        mutex.lock().unwrap();
        thread_join(t).unwrap();
        mutex.unlock().unwrap();
    });
}

#[test]
fn cond_timedwait_times_out_when_never_signaled() {
    run_on_vp(|| {
        init().unwrap();
        let cv = cond_new();
        let err = cv.timedwait(Some(Duration::from_millis(5))).unwrap_err();
        assert!(matches!(err, state_threads::StError::TimedOut));
    });
}

#[test]
fn cond_signal_wins_the_race_against_a_later_timeout() {
    // A waiter with a generous timeout should observe `Ok(())`, not
    // `TimedOut`, when signaled well before its deadline.
    run_on_vp(|| {
        init().unwrap();
        let cv = Arc::new(cond_new());
        let woke = Arc::new(AtomicUsize::new(0));

        let cv2 = cv.clone();
        let woke2 = woke.clone();
        let waiter = thread_create(0, true, None, move || {
            let result = cv2.timedwait(Some(Duration::from_millis(200)));
            if result.is_ok() {
                woke2.store(1, Ordering::SeqCst);
            }
        })
        .unwrap();

        thread_yield();
        sleep(Some(Duration::from_millis(5))).unwrap();
        cv.signal();

        thread_join(waiter).unwrap();
        assert_eq!(woke.load(Ordering::SeqCst), 1);
    });
}

#[test]
fn cond_broadcast_wakes_every_waiter() {
    run_on_vp(|| {
        init().unwrap();
        let cv = Arc::new(cond_new());
        let woke = Arc::new(AtomicUsize::new(0));

        let mut handles = Vec::new();
        for _ in 0..4 {
            let cv = cv.clone();
            let woke = woke.clone();
            handles.push(
                thread_create(0, true, None, move || {
                    if cv.wait().is_ok() {
                        woke.fetch_add(1, Ordering::SeqCst);
                    }
                })
                .unwrap(),
            );
            thread_yield();
        }

        cv.broadcast();

        for h in handles {
            thread_join(h).unwrap();
        }
        assert_eq!(woke.load(Ordering::SeqCst), 4);
    });
}
