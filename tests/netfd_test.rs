//! Descriptor I/O: plain pipe read/write, `poll` boundary behaviors, and an
//! interrupted `accept`, run against a real VP.

use std::thread;
use std::time::Duration;

use pretty_assertions::assert_eq;
use state_threads::{accept, init, netfd_open, netfd_open_socket, poll, read, read_fully, thread_create, thread_interrupt, thread_join, write, PollEvents, PollFd, StError};

fn run_on_vp<F: FnOnce() + Send + 'static>(f: F) {
    thread::spawn(f).join().unwrap();
}

fn make_pipe() -> (i32, i32) {
    let mut fds = [0i32; 2];
    let rv = unsafe { libc::pipe(fds.as_mut_ptr()) };
    assert_eq!(rv, 0);
    (fds[0], fds[1])
}

fn make_listener() -> (i32, libc::sockaddr_in) {
    unsafe {
        let fd = libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0);
        assert!(fd >= 0);
        let mut addr: libc::sockaddr_in = std::mem::zeroed();
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_addr.s_addr = libc::INADDR_LOOPBACK.to_be();
        addr.sin_port = 0;
        let rv = libc::bind(fd, &addr as *const _ as *const libc::sockaddr, std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t);
        assert_eq!(rv, 0);
        let mut len = std::mem::size_of::<libc::sockaddr_in>() as libc::socklen_t;
        let rv = libc::getsockname(fd, &mut addr as *mut _ as *mut libc::sockaddr, &mut len);
        assert_eq!(rv, 0);
        let rv = libc::listen(fd, 4);
        assert_eq!(rv, 0);
        (fd, addr)
    }
}

#[test]
fn pipe_write_then_read_round_trips_bytes() {
    run_on_vp(|| {
        init().unwrap();
        let (rfd, wfd) = make_pipe();
        let reader = netfd_open(rfd).unwrap();
        let writer = netfd_open(wfd).unwrap();

        write(&writer, b"hello", None).unwrap();

        let mut buf = [0u8; 5];
        let n = read(&reader, &mut buf, None).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"hello");
    });
}

#[test]
fn read_fully_suspends_until_every_byte_arrives() {
    run_on_vp(|| {
        init().unwrap();
        let (rfd, wfd) = make_pipe();
        let reader = netfd_open(rfd).unwrap();
        let writer = netfd_open(wfd).unwrap();

        let writer_thread = thread_create(0, true, None, move || {
            write(&writer, b"part1", None).unwrap();
            std::thread::sleep(Duration::from_millis(5));
        })
        .unwrap();

        let mut buf = [0u8; 5];
        let n = read_fully(&reader, &mut buf, None).unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf, b"part1");

        thread_join(writer_thread).unwrap();
    });
}

#[test]
fn poll_with_zero_descriptors_and_timeout_behaves_like_sleep() {
    run_on_vp(|| {
        init().unwrap();
        let start = std::time::Instant::now();
        let n = poll(&mut [], Some(Duration::from_millis(10))).unwrap();
        assert_eq!(n, 0);
        assert!(start.elapsed() >= Duration::from_millis(8));
    });
}

#[test]
fn poll_with_zero_timeout_returns_immediately_when_nothing_ready() {
    run_on_vp(|| {
        init().unwrap();
        let (rfd, _wfd) = make_pipe();
        let reader = netfd_open(rfd).unwrap();
        let mut pds = [PollFd::new(state_threads::netfd_fileno(&reader), PollEvents::READ)];
        let start = std::time::Instant::now();
        let n = poll(&mut pds, Some(Duration::ZERO)).unwrap();
        assert_eq!(n, 0);
        assert!(start.elapsed() < Duration::from_millis(50));
    });
}

#[test]
fn poll_reports_readiness_once_data_is_written() {
    run_on_vp(|| {
        init().unwrap();
        let (rfd, wfd) = make_pipe();
        let reader = netfd_open(rfd).unwrap();
        let writer = netfd_open(wfd).unwrap();

        write(&writer, b"x", None).unwrap();

        let mut pds = [PollFd::new(state_threads::netfd_fileno(&reader), PollEvents::READ)];
        let n = poll(&mut pds, Some(Duration::from_millis(100))).unwrap();
        assert_eq!(n, 1);
        assert!(pds[0].revents.contains(PollEvents::READ));
    });
}

#[test]
fn accept_times_out_with_no_pending_connection() {
    run_on_vp(|| {
        init().unwrap();
        let (fd, _addr) = make_listener();
        let listener = netfd_open_socket(fd).unwrap();
        let err = accept(&listener, None, Some(Duration::from_millis(10))).unwrap_err();
        assert!(matches!(err, StError::TimedOut));
    });
}

#[test]
fn interrupting_a_blocked_accept_wakes_it_with_interrupted() {
    run_on_vp(|| {
        init().unwrap();
        let (fd, _addr) = make_listener();
        let listener = std::sync::Arc::new(netfd_open_socket(fd).unwrap());

        let listener2 = listener.clone();
        let acceptor = thread_create(0, true, None, move || accept(&listener2, None, None)).unwrap();

        // Let the acceptor register its poll interest before interrupting.
        state_threads::thread_yield();
        thread_interrupt(acceptor);

        let result = thread_join(acceptor).unwrap();
        let result = *result.downcast::<Result<state_threads::NetFd, StError>>().unwrap();
        assert!(matches!(result.unwrap_err(), StError::Interrupted));
    });
}
