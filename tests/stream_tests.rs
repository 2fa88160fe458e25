//! Download and upload tests against a scripted server, including the
//! multi-stream aggregation rules.

mod support;

use ndt_client::messages::{
    MSG_EXTENDED_LOGIN, MSG_LOGIN, MSG_LOGOUT, MSG_RESULTS, SRV_QUEUE, TEST_C2S, TEST_FINALIZE,
    TEST_MSG, TEST_PREPARE, TEST_S2C, TEST_S2C_EXT, TEST_START,
};
use ndt_client::{Entry, Error, Reactor, Result, Settings};
use std::cell::RefCell;
use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::io::AsRawFd;
use std::rc::Rc;
use std::time::Duration;

const KICKOFF: &[u8] = b"123456 654321";

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

fn run_client(port: u16, suite: i32) -> Result<Entry> {
    let reactor = Reactor::new().unwrap();
    let outcome = Rc::new(RefCell::new(None));
    let slot = outcome.clone();
    let settings = Settings::new().with("test_suite", suite);
    ndt_client::run_with_specific_server(&reactor, "127.0.0.1", port, settings, move |res| {
        *slot.borrow_mut() = Some(res);
    });
    reactor.run().unwrap();
    let res = outcome.borrow_mut().take();
    res.expect("run callback fired")
}

fn serve_login_and_grant(stream: &mut TcpStream, granted: i32) {
    let (ty, _) = support::recv_frame(stream);
    assert_eq!(ty, MSG_EXTENDED_LOGIN);
    stream.write_all(KICKOFF).unwrap();
    support::send_frame(stream, SRV_QUEUE, "0");
    support::send_frame(stream, MSG_LOGIN, "v3.7.0 (scripted)");
    support::send_frame(stream, MSG_LOGIN, &granted.to_string());
}

fn serve_results_and_logout(stream: &mut TcpStream) {
    support::send_frame(stream, MSG_RESULTS, "CurMSS: 1460");
    support::send_frame(stream, MSG_LOGOUT, "");
}

/// Makes dropping the stream send RST instead of a clean FIN.
fn reset_on_drop(stream: &TcpStream) {
    let linger = libc::linger {
        l_onoff: 1,
        l_linger: 0,
    };
    let rc = unsafe {
        libc::setsockopt(
            stream.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_LINGER,
            &linger as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::linger>() as libc::socklen_t,
        )
    };
    assert_eq!(rc, 0);
}

#[test]
fn multi_stream_download_survives_one_failed_stream() {
    init_logging();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let control_port = listener.local_addr().unwrap().port();
    let server = std::thread::spawn(move || {
        let (mut control, _) = listener.accept().unwrap();
        serve_login_and_grant(&mut control, TEST_S2C);

        let test_listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let test_port = test_listener.local_addr().unwrap().port();
        support::send_frame(
            &mut control,
            TEST_PREPARE,
            &format!("{test_port} 2000 x 500 x 3"),
        );
        let mut streams: Vec<TcpStream> = (0..3)
            .map(|_| test_listener.accept().unwrap().0)
            .collect();
        support::send_frame(&mut control, TEST_START, "");

        // Two streams deliver data and close cleanly; the third dies hard.
        let payload = vec![0x41u8; 64 * 1024];
        for stream in &mut streams[..2] {
            for _ in 0..4 {
                stream.write_all(&payload).unwrap();
            }
        }
        reset_on_drop(&streams[2]);
        drop(streams);

        support::send_frame(&mut control, TEST_MSG, "6000.0");
        let (ty, value) = support::recv_frame(&mut control);
        assert_eq!(ty, TEST_MSG);
        let reported: f64 = value["msg"].as_str().unwrap().parse().unwrap();
        assert!(reported > 0.0);
        support::send_frame(&mut control, TEST_MSG, "CurMSS: 1460");
        support::send_frame(&mut control, TEST_FINALIZE, "");
        serve_results_and_logout(&mut control);
    });

    let entry = run_client(control_port, TEST_S2C).unwrap();
    server.join().unwrap();

    let report = entry.as_json();
    let record = &report["test_s2c"][0];
    assert_eq!(record["params"]["num_streams"], 3);
    assert_eq!(record["connect_times"].as_array().unwrap().len(), 3);
    assert!(record["speed_kbit_s"].as_f64().unwrap() > 0.0);
    assert_eq!(record["web100_data"]["CurMSS"], "1460");
    assert_eq!(report["summary_data"]["CurMSS"], "1460");
}

#[test]
fn speed_samples_cover_the_window_not_the_whole_transfer() {
    init_logging();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let control_port = listener.local_addr().unwrap().port();
    let server = std::thread::spawn(move || {
        let (mut control, _) = listener.accept().unwrap();
        serve_login_and_grant(&mut control, TEST_S2C);

        let test_listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let test_port = test_listener.local_addr().unwrap().port();
        support::send_frame(
            &mut control,
            TEST_PREPARE,
            &format!("{test_port} 10000 x 500 x 1"),
        );
        let (mut stream, _) = test_listener.accept().unwrap();
        support::send_frame(&mut control, TEST_START, "");

        // A burst at the start, then silence across two full windows.
        stream.write_all(&vec![0x41u8; 1024 * 1024]).unwrap();
        std::thread::sleep(Duration::from_millis(1700));
        drop(stream);

        support::send_frame(&mut control, TEST_MSG, "1000.0");
        let (ty, _) = support::recv_frame(&mut control);
        assert_eq!(ty, TEST_MSG);
        support::send_frame(&mut control, TEST_FINALIZE, "");
        serve_results_and_logout(&mut control);
    });

    let entry = run_client(control_port, TEST_S2C).unwrap();
    server.join().unwrap();

    let report = entry.as_json();
    let samples = report["test_s2c"][0]["receiver_data"].as_array().unwrap().clone();
    assert!(samples.len() >= 2, "got {samples:?}");
    let first = samples.first().unwrap()[1].as_f64().unwrap();
    let last = samples.last().unwrap()[1].as_f64().unwrap();
    assert!(first > 1000.0, "burst window reads too slow: {samples:?}");
    assert!(
        last < first / 4.0,
        "silent window still shows the running average: {samples:?}"
    );
}

#[test]
fn extended_download_grant_runs_the_download_test() {
    init_logging();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let control_port = listener.local_addr().unwrap().port();
    let server = std::thread::spawn(move || {
        let (mut control, _) = listener.accept().unwrap();
        serve_login_and_grant(&mut control, TEST_S2C_EXT);

        let test_listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let test_port = test_listener.local_addr().unwrap().port();
        support::send_frame(&mut control, TEST_PREPARE, &test_port.to_string());
        let (mut stream, _) = test_listener.accept().unwrap();
        support::send_frame(&mut control, TEST_START, "");

        stream.write_all(&vec![0x41u8; 64 * 1024]).unwrap();
        drop(stream);

        support::send_frame(&mut control, TEST_MSG, "1000.0");
        let (ty, _) = support::recv_frame(&mut control);
        assert_eq!(ty, TEST_MSG);
        support::send_frame(&mut control, TEST_FINALIZE, "");
        serve_results_and_logout(&mut control);
    });

    let entry = run_client(control_port, TEST_S2C_EXT).unwrap();
    server.join().unwrap();

    let report = entry.as_json();
    let record = &report["test_s2c"][0];
    assert_eq!(record["connect_times"].as_array().unwrap().len(), 1);
    assert!(record["speed_kbit_s"].as_f64().unwrap() > 0.0);
}

#[test]
fn single_stream_download_propagates_a_hard_error() {
    init_logging();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let control_port = listener.local_addr().unwrap().port();
    let server = std::thread::spawn(move || {
        let (mut control, _) = listener.accept().unwrap();
        serve_login_and_grant(&mut control, TEST_S2C);

        let test_listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let test_port = test_listener.local_addr().unwrap().port();
        support::send_frame(&mut control, TEST_PREPARE, &test_port.to_string());
        let (stream, _) = test_listener.accept().unwrap();
        support::send_frame(&mut control, TEST_START, "");

        std::thread::sleep(Duration::from_millis(50));
        reset_on_drop(&stream);
        drop(stream);
        // Wait for the client to give up and hang up.
        let _ = control.read(&mut [0u8; 1]);
    });

    let err = run_client(control_port, TEST_S2C).unwrap_err();
    server.join().unwrap();
    assert!(matches!(err, Error::Io(_)), "got {err}");
}

#[test]
fn upload_reports_the_server_measured_speed() {
    init_logging();
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let control_port = listener.local_addr().unwrap().port();
    let server = std::thread::spawn(move || {
        let (mut control, _) = listener.accept().unwrap();
        serve_login_and_grant(&mut control, TEST_C2S);

        let test_listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let test_port = test_listener.local_addr().unwrap().port();
        // One second of upload.
        support::send_frame(&mut control, TEST_PREPARE, &format!("{test_port} 1000"));
        let (mut stream, _) = test_listener.accept().unwrap();
        support::send_frame(&mut control, TEST_START, "");

        let mut received = 0usize;
        let mut buf = [0u8; 16 * 1024];
        loop {
            match stream.read(&mut buf) {
                Ok(0) | Err(_) => break,
                Ok(n) => received += n,
            }
        }
        assert!(received > 0, "the client never sent upload data");

        support::send_frame(&mut control, TEST_MSG, "4321.5");
        support::send_frame(&mut control, TEST_FINALIZE, "");
        serve_results_and_logout(&mut control);
    });

    let entry = run_client(control_port, TEST_C2S).unwrap();
    server.join().unwrap();

    let report = entry.as_json();
    let record = &report["test_c2s"][0];
    assert_eq!(record["connect_times"].as_array().unwrap().len(), 1);
    assert_eq!(record["speed_kbit_s"].as_f64().unwrap(), 4321.5);
}
