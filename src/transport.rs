//! Connected, non-blocking, buffered socket driven by the reactor.
//!
//! A [`Transport`] exposes event-style callbacks (`on_data`, `on_flush`,
//! `on_error`) instead of blocking reads and writes. Every armed wait
//! carries the transport timeout; expiry surfaces as [`Error::Timeout`],
//! while the peer closing the connection surfaces as [`Error::Eof`] so that
//! protocol code can implement "stream ends when peer closes" semantics.

use crate::error::{Error, Result};
use crate::reactor::{set_nonblocking, PollToken, Reactor};
use log::{debug, trace, warn};
use std::cell::RefCell;
use std::io::{Read, Write};
use std::net::{IpAddr, SocketAddr, TcpStream, ToSocketAddrs};
use std::os::unix::io::{FromRawFd, RawFd};
use std::rc::Rc;
use std::time::Duration;

/// Default I/O timeout applied until the owner overrides it.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(10);

const READ_CHUNK: usize = 8192;

type DataHandler = Box<dyn FnMut(&[u8])>;
type FlushHandler = Box<dyn FnMut()>;
type ErrorHandler = Box<dyn FnMut(Error)>;

struct Inner {
    reactor: Reactor,
    stream: Option<TcpStream>,
    fd: RawFd,
    out: Vec<u8>,
    timeout: Duration,
    reading: bool,
    closed: bool,
    read_token: Option<PollToken>,
    write_token: Option<PollToken>,
    on_data: Option<DataHandler>,
    on_flush: Option<FlushHandler>,
    on_error: Option<ErrorHandler>,
}

/// Cheaply clonable handle to one connected socket.
#[derive(Clone)]
pub struct Transport {
    inner: Rc<RefCell<Inner>>,
}

impl Transport {
    /// Opens a connection to `address:port` and hands the connected
    /// transport to `cb`. The connect itself is non-blocking; when
    /// `address` is a hostname the blocking resolver call runs on a
    /// background worker thread first.
    pub fn connect<F>(reactor: &Reactor, address: &str, port: u16, timeout: Duration, cb: F)
    where
        F: FnOnce(Result<Transport>) + 'static,
    {
        if let Ok(ip) = address.parse::<IpAddr>() {
            Self::connect_addr(reactor, SocketAddr::new(ip, port), timeout, cb);
            return;
        }
        debug!("resolving {address} on a worker thread");
        let host = address.to_string();
        reactor.run_in_background(
            move || {
                (host.as_str(), port)
                    .to_socket_addrs()
                    .map(|mut addrs| addrs.next())
            },
            move |reactor, resolved| match resolved {
                Ok(Some(addr)) => Self::connect_addr(reactor, addr, timeout, cb),
                Ok(None) => cb(Err(Error::Io(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "hostname resolved to no address",
                )))),
                Err(err) => cb(Err(Error::Io(err))),
            },
        );
    }

    fn connect_addr<F>(reactor: &Reactor, addr: SocketAddr, timeout: Duration, cb: F)
    where
        F: FnOnce(Result<Transport>) + 'static,
    {
        trace!("connecting to {addr}");
        let family = match addr {
            SocketAddr::V4(_) => libc::AF_INET,
            SocketAddr::V6(_) => libc::AF_INET6,
        };
        let fd = unsafe { libc::socket(family, libc::SOCK_STREAM, 0) };
        if fd < 0 {
            cb(Err(Error::Io(std::io::Error::last_os_error())));
            return;
        }
        if let Err(err) = set_nonblocking(fd) {
            unsafe { libc::close(fd) };
            cb(Err(err));
            return;
        }

        let (storage, len) = sockaddr_from(&addr);
        let rc = unsafe {
            libc::connect(fd, &storage as *const _ as *const libc::sockaddr, len)
        };
        if rc != 0 {
            let err = std::io::Error::last_os_error();
            if err.raw_os_error() != Some(libc::EINPROGRESS) {
                unsafe { libc::close(fd) };
                cb(Err(Error::Io(err)));
                return;
            }
        }

        let handle = reactor.clone();
        reactor.pollout(fd, timeout, move |ready| match ready {
            Ok(()) => match connect_result(fd) {
                Ok(()) => cb(Ok(Transport::from_fd(&handle, fd, timeout))),
                Err(err) => {
                    unsafe { libc::close(fd) };
                    cb(Err(err));
                }
            },
            Err(err) => {
                unsafe { libc::close(fd) };
                cb(Err(err));
            }
        });
    }

    /// Wraps an already-connected, non-blocking descriptor.
    fn from_fd(reactor: &Reactor, fd: RawFd, timeout: Duration) -> Transport {
        let stream = unsafe { TcpStream::from_raw_fd(fd) };
        Transport {
            inner: Rc::new(RefCell::new(Inner {
                reactor: reactor.clone(),
                stream: Some(stream),
                fd,
                out: Vec::new(),
                timeout,
                reading: false,
                closed: false,
                read_token: None,
                write_token: None,
                on_data: None,
                on_flush: None,
                on_error: None,
            })),
        }
    }

    pub fn set_timeout(&self, timeout: Duration) {
        self.inner.borrow_mut().timeout = timeout;
    }

    pub fn is_closed(&self) -> bool {
        self.inner.borrow().closed
    }

    /// Installs the handler invoked with each received chunk. Reading does
    /// not start until [`resume_reading`](Self::resume_reading) is called.
    pub fn on_data<F>(&self, f: F)
    where
        F: FnMut(&[u8]) + 'static,
    {
        self.inner.borrow_mut().on_data = Some(Box::new(f));
    }

    /// Installs the handler invoked whenever the write buffer drains.
    pub fn on_flush<F>(&self, f: F)
    where
        F: FnMut() + 'static,
    {
        self.inner.borrow_mut().on_flush = Some(Box::new(f));
    }

    /// Installs the handler receiving EOF, timeout and hard I/O errors.
    pub fn on_error<F>(&self, f: F)
    where
        F: FnMut(Error) + 'static,
    {
        self.inner.borrow_mut().on_error = Some(Box::new(f));
    }

    /// Starts (or restarts) delivering inbound data to `on_data`.
    pub fn resume_reading(&self) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.closed || inner.read_token.is_some() {
                return;
            }
            inner.reading = true;
        }
        Self::arm_read(&self.inner);
    }

    /// Stops delivering inbound data; the pending readiness wait is dropped.
    pub fn pause_reading(&self) {
        let mut inner = self.inner.borrow_mut();
        inner.reading = false;
        if let Some(token) = inner.read_token.take() {
            inner.reactor.cancel(token);
        }
    }

    /// Appends `data` to the write buffer and arms writability polling.
    pub fn write(&self, data: &[u8]) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.closed {
                warn!("write on closed transport ignored");
                return;
            }
            inner.out.extend_from_slice(data);
            if inner.write_token.is_some() || inner.out.is_empty() {
                return;
            }
        }
        Self::arm_write(&self.inner);
    }

    /// Closes the socket. Idempotent; outstanding readiness waits are
    /// cancelled so no callback fires after close.
    pub fn close(&self) {
        let mut inner = self.inner.borrow_mut();
        if inner.closed {
            return;
        }
        inner.closed = true;
        inner.reading = false;
        if let Some(token) = inner.read_token.take() {
            inner.reactor.cancel(token);
        }
        if let Some(token) = inner.write_token.take() {
            inner.reactor.cancel(token);
        }
        inner.on_data = None;
        inner.on_flush = None;
        inner.on_error = None;
        // Dropping the TcpStream closes the descriptor.
        inner.stream.take();
        trace!("transport fd {} closed", inner.fd);
    }

    fn arm_read(inner: &Rc<RefCell<Inner>>) {
        let (reactor, fd, timeout) = {
            let inner = inner.borrow();
            (inner.reactor.clone(), inner.fd, inner.timeout)
        };
        let weak = Rc::clone(inner);
        let token = reactor.pollin(fd, timeout, move |ready| {
            Self::handle_readable(&weak, ready);
        });
        inner.borrow_mut().read_token = Some(token);
    }

    fn handle_readable(inner: &Rc<RefCell<Inner>>, ready: Result<()>) {
        {
            let mut b = inner.borrow_mut();
            b.read_token = None;
            if b.closed || !b.reading {
                return;
            }
        }
        if let Err(err) = ready {
            Self::emit_error(inner, err);
            return;
        }
        let mut buf = [0u8; READ_CHUNK];
        let outcome = {
            let b = inner.borrow();
            match b.stream.as_ref() {
                Some(stream) => (&*stream).read(&mut buf),
                None => return,
            }
        };
        match outcome {
            Ok(0) => Self::emit_error(inner, Error::Eof),
            Ok(n) => {
                Self::emit_data(inner, &buf[..n]);
                // The data handler may have paused and resumed, leaving a
                // fresh wait already armed.
                let still_reading = {
                    let b = inner.borrow();
                    b.reading && !b.closed && b.read_token.is_none()
                };
                if still_reading {
                    Self::arm_read(inner);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Self::arm_read(inner),
            Err(err) => Self::emit_error(inner, Error::Io(err)),
        }
    }

    fn arm_write(inner: &Rc<RefCell<Inner>>) {
        let (reactor, fd, timeout) = {
            let inner = inner.borrow();
            (inner.reactor.clone(), inner.fd, inner.timeout)
        };
        let weak = Rc::clone(inner);
        let token = reactor.pollout(fd, timeout, move |ready| {
            Self::handle_writable(&weak, ready);
        });
        inner.borrow_mut().write_token = Some(token);
    }

    fn handle_writable(inner: &Rc<RefCell<Inner>>, ready: Result<()>) {
        {
            let mut b = inner.borrow_mut();
            b.write_token = None;
            if b.closed {
                return;
            }
        }
        if let Err(err) = ready {
            Self::emit_error(inner, err);
            return;
        }
        let outcome = {
            let b = inner.borrow();
            match b.stream.as_ref() {
                Some(stream) => (&*stream).write(&b.out),
                None => return,
            }
        };
        match outcome {
            Ok(n) => {
                let drained = {
                    let mut b = inner.borrow_mut();
                    b.out.drain(..n);
                    b.out.is_empty()
                };
                if drained {
                    Self::emit_flush(inner);
                    // The flush handler may have queued more output.
                    let rearm = {
                        let b = inner.borrow();
                        !b.closed && !b.out.is_empty() && b.write_token.is_none()
                    };
                    if rearm {
                        Self::arm_write(inner);
                    }
                } else {
                    Self::arm_write(inner);
                }
            }
            Err(err) if err.kind() == std::io::ErrorKind::WouldBlock => Self::arm_write(inner),
            Err(err) => Self::emit_error(inner, Error::Io(err)),
        }
    }

    fn emit_data(inner: &Rc<RefCell<Inner>>, chunk: &[u8]) {
        let handler = inner.borrow_mut().on_data.take();
        if let Some(mut handler) = handler {
            handler(chunk);
            let mut b = inner.borrow_mut();
            // Keep the handler unless the callback installed a new one.
            if b.on_data.is_none() && !b.closed {
                b.on_data = Some(handler);
            }
        } else {
            trace!("dropping {} inbound bytes without a data handler", chunk.len());
        }
    }

    fn emit_flush(inner: &Rc<RefCell<Inner>>) {
        let handler = inner.borrow_mut().on_flush.take();
        if let Some(mut handler) = handler {
            handler();
            let mut b = inner.borrow_mut();
            if b.on_flush.is_none() && !b.closed {
                b.on_flush = Some(handler);
            }
        }
    }

    fn emit_error(inner: &Rc<RefCell<Inner>>, err: Error) {
        let handler = inner.borrow_mut().on_error.take();
        if let Some(mut handler) = handler {
            handler(err);
            let mut b = inner.borrow_mut();
            if b.on_error.is_none() && !b.closed {
                b.on_error = Some(handler);
            }
        } else {
            warn!("transport error with no handler installed: {err}");
        }
    }
}

fn sockaddr_from(addr: &SocketAddr) -> (libc::sockaddr_storage, libc::socklen_t) {
    let mut storage: libc::sockaddr_storage = unsafe { std::mem::zeroed() };
    let len = match addr {
        SocketAddr::V4(v4) => {
            let sin = &mut storage as *mut _ as *mut libc::sockaddr_in;
            unsafe {
                (*sin).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sin).sin_port = v4.port().to_be();
                (*sin).sin_addr = libc::in_addr {
                    s_addr: u32::from_ne_bytes(v4.ip().octets()),
                };
            }
            std::mem::size_of::<libc::sockaddr_in>()
        }
        SocketAddr::V6(v6) => {
            let sin6 = &mut storage as *mut _ as *mut libc::sockaddr_in6;
            unsafe {
                (*sin6).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sin6).sin6_port = v6.port().to_be();
                (*sin6).sin6_addr.s6_addr = v6.ip().octets();
            }
            std::mem::size_of::<libc::sockaddr_in6>()
        }
    };
    (storage, len as libc::socklen_t)
}

fn connect_result(fd: RawFd) -> Result<()> {
    let mut err: libc::c_int = 0;
    let mut len = std::mem::size_of::<libc::c_int>() as libc::socklen_t;
    let rc = unsafe {
        libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut err as *mut _ as *mut libc::c_void,
            &mut len,
        )
    };
    if rc != 0 {
        return Err(Error::Io(std::io::Error::last_os_error()));
    }
    if err != 0 {
        return Err(Error::Io(std::io::Error::from_raw_os_error(err)));
    }
    Ok(())
}
