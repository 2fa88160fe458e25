//! Transport behavior around pausing and resuming reads.

use ndt_client::{Reactor, Transport};
use std::cell::RefCell;
use std::io::Write;
use std::net::TcpListener;
use std::rc::Rc;
use std::time::Duration;

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// A message-framed reader pauses after each delivery and resumes for the
/// next read. Doing that from inside the data handler must leave exactly
/// one armed wait behind, so after the peer goes silent exactly one
/// timeout surfaces.
#[test]
fn resume_from_the_data_handler_leaves_one_read_armed() {
    init_logging();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let server = std::thread::spawn(move || {
        let (mut stream, _) = listener.accept().unwrap();
        stream.write_all(b"a").unwrap();
        std::thread::sleep(Duration::from_millis(100));
        stream.write_all(b"b").unwrap();
        // Stay silent and connected long enough for every armed wait,
        // including any stray duplicate, to run into its timeout.
        std::thread::sleep(Duration::from_millis(800));
    });

    let reactor = Reactor::new().unwrap();
    let received = Rc::new(RefCell::new(0usize));
    let errors = Rc::new(RefCell::new(0u32));
    {
        let received = Rc::clone(&received);
        let errors = Rc::clone(&errors);
        Transport::connect(
            &reactor,
            "127.0.0.1",
            port,
            Duration::from_millis(300),
            move |res| {
                let txp = res.unwrap();
                txp.set_timeout(Duration::from_millis(300));
                let handle = txp.clone();
                txp.on_data(move |chunk| {
                    *received.borrow_mut() += chunk.len();
                    handle.pause_reading();
                    handle.resume_reading();
                });
                txp.on_error(move |_| {
                    *errors.borrow_mut() += 1;
                });
                txp.resume_reading();
            },
        );
    }
    let stopper = reactor.clone();
    reactor.call_later(Duration::from_millis(700), move || stopper.stop());
    reactor.run().unwrap();
    server.join().unwrap();

    assert_eq!(*received.borrow(), 2);
    assert_eq!(*errors.borrow(), 1, "expected a single timeout wait");
}
