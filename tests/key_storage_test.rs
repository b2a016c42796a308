//! Per-coroutine keyed storage end to end: values are private per
//! coroutine, and destructors run at exit.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread;

use pretty_assertions::assert_eq;
use serial_test::serial;
use state_threads::{init, key_create, key_getlimit, thread_create, thread_getspecific, thread_join, thread_setspecific};

fn run_on_vp<F: FnOnce() + Send + 'static>(f: F) {
    thread::spawn(f).join().unwrap();
}

#[test]
fn key_getlimit_is_always_sixteen() {
    assert_eq!(key_getlimit(), 16);
}

#[test]
#[serial]
fn each_coroutine_sees_its_own_value() {
    run_on_vp(|| {
        init().unwrap();
        let key = key_create(None).unwrap();

        let t1 = thread_create(0, true, None, move || {
            thread_setspecific(key, Box::new(1i32));
            *thread_getspecific(key).unwrap().downcast_ref::<i32>().unwrap()
        })
        .unwrap();
        let t2 = thread_create(0, true, None, move || {
            thread_setspecific(key, Box::new(2i32));
            *thread_getspecific(key).unwrap().downcast_ref::<i32>().unwrap()
        })
        .unwrap();

        let r1 = *thread_join(t1).unwrap().downcast::<i32>().unwrap();
        let r2 = *thread_join(t2).unwrap().downcast::<i32>().unwrap();
        assert_eq!(r1, 1);
        assert_eq!(r2, 2);
    });
}

#[test]
#[serial]
fn destructor_runs_when_coroutine_with_a_value_exits() {
    run_on_vp(|| {
        init().unwrap();
        let ran = Arc::new(AtomicUsize::new(0));
        let ran2 = ran.clone();
        let key = key_create(Some(Box::new(move |_v| {
            ran2.fetch_add(1, Ordering::SeqCst);
        })))
        .unwrap();

        let t = thread_create(0, true, None, move || {
            thread_setspecific(key, Box::new(99i32));
        })
        .unwrap();
        thread_join(t).unwrap();

        assert_eq!(ran.load(Ordering::SeqCst), 1);
    });
}
