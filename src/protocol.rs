//! The NDT control-protocol state machine.
//!
//! Every control-channel step is a [`Phase`]; [`advance`] is the single
//! dispatch point that moves the machine from one phase to the next. Phase
//! handlers register a continuation only where the machine genuinely
//! suspends on I/O or on a timer, and each continuation re-enters through
//! `advance`. Any error short-circuits straight to
//! [`disconnect_and_callback`], which closes the control connection and
//! fires the run callback exactly once.

use crate::context::Ctx;
use crate::error::{Error, Result};
use crate::messages::{self, KICKOFF_MESSAGE, NDT_VERSION};
use crate::transport::Transport;
use crate::{test_c2s, test_meta, test_s2c};
use log::{debug, info, warn};
use std::rc::Rc;
use std::time::Duration;

/// How long we grant the server to close its side after MSG_LOGOUT.
const CLOSE_GRACE: Duration = Duration::from_secs(1);

/// How long to sit on a queue-position update before reading the next one.
const QUEUE_RETRY: Duration = Duration::from_secs(1);

// SRV_QUEUE payload values with special meaning.
const SRV_QUEUE_TEST_STARTS_NOW: u64 = 0;
const SRV_QUEUE_SERVER_FAULT: u64 = 9977;
const SRV_QUEUE_SERVER_BUSY: u64 = 9987;
const SRV_QUEUE_HEARTBEAT: u64 = 9990;
const SRV_QUEUE_SERVER_BUSY_60S: u64 = 9999;

/// The control-channel states, in the order a clean run visits them.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Connect,
    SendLogin,
    RecvKickoff,
    WaitQueue,
    RecvVersion,
    RecvTestsIds,
    RunTests,
    RecvResults,
    WaitClose,
}

/// Dispatches the machine into `phase`. Every transition funnels through
/// here, including re-entry from I/O continuations.
fn advance(ctx: Ctx, phase: Phase) {
    match phase {
        Phase::Connect => connect(ctx),
        Phase::SendLogin => send_extended_login(ctx),
        Phase::RecvKickoff => recv_and_ignore_kickoff(ctx),
        Phase::WaitQueue => wait_in_queue(ctx),
        Phase::RecvVersion => recv_version(ctx),
        Phase::RecvTestsIds => recv_tests_ids(ctx),
        Phase::RunTests => run_tests(ctx),
        Phase::RecvResults => recv_results_and_logout(ctx),
        Phase::WaitClose => wait_close(ctx),
    }
}

/// Starts the machine on a freshly built context.
pub(crate) fn start(ctx: Ctx) {
    advance(ctx, Phase::Connect);
}

/// Short-circuits the machine on error. `Some(value)` means proceed.
fn check<T>(ctx: &Ctx, result: Result<T>) -> Option<T> {
    match result {
        Ok(value) => Some(value),
        Err(err) => {
            disconnect_and_callback(ctx, Err(err));
            None
        }
    }
}

fn connect(ctx: Ctx) {
    let (reactor, address, port, timeout) = {
        let c = ctx.borrow();
        (c.reactor.clone(), c.address.clone(), c.port, c.timeout)
    };
    info!("connecting to {address}:{port}");
    Transport::connect(&reactor, &address, port, timeout, move |res| {
        let Some(txp) = check(
            &ctx,
            res.map_err(|err| Error::ConnectControlConnection(Box::new(err))),
        ) else {
            return;
        };
        {
            let mut c = ctx.borrow_mut();
            c.txp = Some(txp);
            let address = c.address.clone();
            let port = c.port;
            let suite = c.test_suite;
            c.entry.set("server_address", address);
            c.entry.set("server_port", port);
            c.entry.set("client_version", NDT_VERSION);
            c.entry.set("test_suite", suite);
        }
        advance(ctx, Phase::SendLogin);
    });
}

fn send_extended_login(ctx: Ctx) {
    let suite = ctx.borrow().test_suite;
    debug!("sending extended login, suite {suite}");
    let Some(frame) = check(&ctx, messages::format_msg_extended_login(suite)) else {
        return;
    };
    let next = Rc::clone(&ctx);
    messages::write(&ctx, frame, move |res| {
        if check(&next, res).is_none() {
            return;
        }
        advance(next, Phase::RecvKickoff);
    });
}

fn recv_and_ignore_kickoff(ctx: Ctx) {
    let next = Rc::clone(&ctx);
    messages::readn(&ctx, KICKOFF_MESSAGE.len(), move |res| {
        let Some(bytes) = check(
            &next,
            res.map_err(|err| Error::ReadingKickoffMessage(Box::new(err))),
        ) else {
            return;
        };
        if bytes != KICKOFF_MESSAGE {
            disconnect_and_callback(&next, Err(Error::InvalidKickoffMessage));
            return;
        }
        debug!("kickoff received");
        advance(next, Phase::WaitQueue);
    });
}

/// Waits until the server lets us in. Heartbeats are answered and
/// queue-position updates are logged; neither bounds how long we wait.
fn wait_in_queue(ctx: Ctx) {
    let next = Rc::clone(&ctx);
    messages::read_msg(&ctx, move |res| {
        let Some((ty, msg)) = check(
            &next,
            res.map_err(|err| Error::ReadingSrvQueueMessage(Box::new(err))),
        ) else {
            return;
        };
        if ty != messages::SRV_QUEUE {
            disconnect_and_callback(&next, Err(Error::NotSrvQueueMessage(ty)));
            return;
        }
        let Some(code) = check(
            &next,
            msg.trim()
                .parse::<u64>()
                .map_err(|_| Error::InvalidSrvQueueMessage),
        ) else {
            return;
        };
        match code {
            SRV_QUEUE_TEST_STARTS_NOW => {
                debug!("queue cleared, proceeding");
                advance(next, Phase::RecvVersion);
            }
            SRV_QUEUE_SERVER_FAULT => {
                disconnect_and_callback(&next, Err(Error::QueueServerFault));
            }
            SRV_QUEUE_SERVER_BUSY | SRV_QUEUE_SERVER_BUSY_60S => {
                disconnect_and_callback(&next, Err(Error::QueueServerBusy));
            }
            SRV_QUEUE_HEARTBEAT => {
                debug!("queue heartbeat, replying");
                let Some(frame) = check(&next, messages::format_msg_waiting()) else {
                    return;
                };
                let again = Rc::clone(&next);
                messages::write(&next, frame, move |res| {
                    if check(&again, res).is_none() {
                        return;
                    }
                    advance(again, Phase::WaitQueue);
                });
            }
            position => {
                info!("waiting in queue, position {position}");
                let reactor = next.borrow().reactor.clone();
                reactor.call_later(QUEUE_RETRY, move || advance(next, Phase::WaitQueue));
            }
        }
    });
}

fn recv_version(ctx: Ctx) {
    let next = Rc::clone(&ctx);
    messages::read_msg(&ctx, move |res| {
        let Some((ty, msg)) = check(
            &next,
            res.map_err(|err| Error::ReadingServerVersionMessage(Box::new(err))),
        ) else {
            return;
        };
        if ty != messages::MSG_LOGIN {
            disconnect_and_callback(&next, Err(Error::NotServerVersionMessage(ty)));
            return;
        }
        info!("server version: {msg}");
        next.borrow_mut().entry.set("server_version", msg);
        advance(next, Phase::RecvTestsIds);
    });
}

/// The server lists the granted tests in run order.
fn recv_tests_ids(ctx: Ctx) {
    let next = Rc::clone(&ctx);
    messages::read_msg(&ctx, move |res| {
        let Some((ty, msg)) = check(
            &next,
            res.map_err(|err| Error::ReadingTestsIdMessage(Box::new(err))),
        ) else {
            return;
        };
        if ty != messages::MSG_LOGIN {
            disconnect_and_callback(&next, Err(Error::NotTestsIdMessage(ty)));
            return;
        }
        debug!("granted tests: {msg:?}");
        for token in msg.split_whitespace() {
            let Some(id) = check(
                &next,
                token
                    .parse::<i32>()
                    .map_err(|_| Error::InvalidTestId(token.to_string())),
            ) else {
                return;
            };
            next.borrow_mut().granted_suite.push_back(id);
        }
        advance(next, Phase::RunTests);
    });
}

/// Runs the next granted test; once the queue is empty the machine moves
/// on to results collection.
fn run_tests(ctx: Ctx) {
    let id = ctx.borrow_mut().granted_suite.pop_front();
    let Some(id) = id else {
        advance(ctx, Phase::RecvResults);
        return;
    };
    let next = Rc::clone(&ctx);
    let after: Box<dyn FnOnce(Result<()>)> = Box::new(move |res| {
        if check(&next, res).is_none() {
            return;
        }
        advance(next, Phase::RunTests);
    });
    match id {
        messages::TEST_C2S => {
            info!("starting upload test");
            test_c2s::run(&ctx, after);
        }
        messages::TEST_S2C | messages::TEST_S2C_EXT => {
            info!("starting download test");
            test_s2c::run(&ctx, after);
        }
        messages::TEST_META => {
            info!("starting meta test");
            test_meta::run(&ctx, after);
        }
        unknown => {
            warn!("server granted a test we cannot run: {unknown}");
            after(Err(Error::UnknownTestId(unknown)));
        }
    }
}

/// Drains MSG_RESULTS blocks until MSG_LOGOUT.
///
/// Each results payload is newline-separated `name: value` pairs, collected
/// under `summary_data` in the report.
fn recv_results_and_logout(ctx: Ctx) {
    let next = Rc::clone(&ctx);
    messages::read_msg(&ctx, move |res| {
        let Some((ty, msg)) = check(
            &next,
            res.map_err(|err| Error::ReadingResultsOrLogout(Box::new(err))),
        ) else {
            return;
        };
        match ty {
            messages::MSG_RESULTS => {
                let mut c = next.borrow_mut();
                for line in msg.lines() {
                    if let Some((name, value)) = line.split_once(':') {
                        c.entry
                            .set_nested("summary_data", name.trim(), value.trim());
                    }
                }
                drop(c);
                advance(next, Phase::RecvResults);
            }
            messages::MSG_LOGOUT => {
                debug!("logout received");
                advance(next, Phase::WaitClose);
            }
            other => disconnect_and_callback(&next, Err(Error::NotResultsOrLogout(other))),
        }
    });
}

/// Gives the server a moment to close first. Both EOF and the grace timeout
/// are clean outcomes; actual data at this point is a protocol violation.
fn wait_close(ctx: Ctx) {
    if let Some(txp) = ctx.borrow().txp.as_ref() {
        txp.set_timeout(CLOSE_GRACE);
    }
    let next = Rc::clone(&ctx);
    messages::readn(&ctx, 1, move |res| match res {
        Ok(_) => disconnect_and_callback(&next, Err(Error::DataAfterLogout)),
        Err(err) if err.is_eof() || err.is_timeout() => {
            debug!("server side closed, run complete");
            disconnect_and_callback(&next, Ok(()));
        }
        Err(err) => {
            disconnect_and_callback(&next, Err(Error::WaitingClose(Box::new(err))));
        }
    });
}

/// Terminal state: closes the control connection and fires the run
/// callback. Safe to reach from any phase; only the first arrival has any
/// effect.
pub(crate) fn disconnect_and_callback(ctx: &Ctx, result: Result<()>) {
    let (txp, callback, entry) = {
        let mut c = ctx.borrow_mut();
        (
            c.txp.take(),
            c.callback.take(),
            std::mem::take(&mut c.entry),
        )
    };
    if let Some(txp) = txp {
        txp.close();
    }
    if let Some(callback) = callback {
        callback(result.map(|()| entry));
    }
}
