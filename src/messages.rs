//! NDT wire format: message constants, framing and the asynchronous
//! read/write primitives used by the protocol phases.
//!
//! Every control message is `[type: u8][length: u16 BE][payload]`; payloads
//! are JSON objects whose interesting field is `"msg"`. Reads are
//! continuation-passing: each operation installs transport handlers, pauses
//! the read pump once satisfied and hands the result to its callback.

use crate::context::Ctx;
use crate::error::{Error, Result};
use crate::transport::Transport;
use log::debug;
use serde_json::{json, Value};
use std::cell::RefCell;
use std::rc::Rc;

/// Default NDT control port.
pub const NDT_PORT: u16 = 3001;

/// Client version announced at login.
pub(crate) const NDT_VERSION: &str = concat!("v3.7.0 (ndt-client/", env!("CARGO_PKG_VERSION"), ")");

/// Bytes the server sends right after accepting the login.
pub(crate) const KICKOFF_MESSAGE: &[u8] = b"123456 654321";

// Control message types.
pub const SRV_QUEUE: u8 = 1;
pub const MSG_LOGIN: u8 = 2;
pub const TEST_PREPARE: u8 = 3;
pub const TEST_START: u8 = 4;
pub const TEST_MSG: u8 = 5;
pub const TEST_FINALIZE: u8 = 6;
pub const MSG_RESULTS: u8 = 8;
pub const MSG_LOGOUT: u8 = 9;
pub const MSG_WAITING: u8 = 10;
pub const MSG_EXTENDED_LOGIN: u8 = 11;

// Test identifiers, OR-ed together into a suite.
pub const TEST_MID: i32 = 1;
pub const TEST_C2S: i32 = 2;
pub const TEST_S2C: i32 = 4;
pub const TEST_SFW: i32 = 8;
pub const TEST_STATUS: i32 = 16;
pub const TEST_META: i32 = 32;
pub const TEST_S2C_EXT: i32 = 128;

/// Frames `message` as a control message of the given type.
pub(crate) fn format_any(ty: u8, message: &Value) -> Result<Vec<u8>> {
    let body = message.to_string();
    if body.len() > u16::MAX as usize {
        return Err(Error::MessageTooLong);
    }
    let mut out = Vec::with_capacity(3 + body.len());
    out.push(ty);
    out.extend_from_slice(&(body.len() as u16).to_be_bytes());
    out.extend_from_slice(body.as_bytes());
    Ok(out)
}

/// The MSG_EXTENDED_LOGIN announcing our version and requested suite.
pub(crate) fn format_msg_extended_login(suite: i32) -> Result<Vec<u8>> {
    format_any(
        MSG_EXTENDED_LOGIN,
        &json!({ "msg": NDT_VERSION, "tests": suite.to_string() }),
    )
    .map_err(|_| Error::FormatExtendedLoginMessage)
}

/// A TEST_MSG carrying `msg` as its payload.
pub(crate) fn format_test_msg(msg: &str) -> Result<Vec<u8>> {
    format_any(TEST_MSG, &json!({ "msg": msg }))
}

/// The keep-alive reply to a SRV_QUEUE heartbeat.
pub(crate) fn format_msg_waiting() -> Result<Vec<u8>> {
    format_any(MSG_WAITING, &json!({ "msg": "" }))
}

/// Delivers exactly `count` bytes from the control connection to `cb`,
/// consuming stashed bytes first. Extra bytes arriving in the same chunk
/// stay stashed for the next read.
pub(crate) fn readn<F>(ctx: &Ctx, count: usize, cb: F)
where
    F: FnOnce(Result<Vec<u8>>) + 'static,
{
    let (reactor, txp, stash) = {
        let c = ctx.borrow();
        (c.reactor.clone(), c.txp.clone(), Rc::clone(&c.stash))
    };
    let txp = match txp {
        Some(txp) => txp,
        None => {
            cb(Err(Error::Eof));
            return;
        }
    };
    if stash.borrow().len() >= count {
        let bytes: Vec<u8> = stash.borrow_mut().drain(..count).collect();
        // Stay asynchronous even when the bytes are already here.
        reactor.call_soon(move || cb(Ok(bytes)));
        return;
    }

    let slot: Rc<RefCell<Option<F>>> = Rc::new(RefCell::new(Some(cb)));
    {
        let slot = Rc::clone(&slot);
        let stash = Rc::clone(&stash);
        let txp = txp.clone();
        txp.clone().on_data(move |chunk| {
            stash.borrow_mut().extend_from_slice(chunk);
            if stash.borrow().len() < count {
                return;
            }
            if let Some(cb) = slot.borrow_mut().take() {
                let bytes: Vec<u8> = stash.borrow_mut().drain(..count).collect();
                txp.pause_reading();
                cb(Ok(bytes));
            }
        });
    }
    {
        let slot = Rc::clone(&slot);
        txp.on_error(move |err| {
            if let Some(cb) = slot.borrow_mut().take() {
                cb(Err(err));
            }
        });
    }
    txp.resume_reading();
}

/// Reads one framed message: type, length, payload bytes.
pub(crate) fn read_ll<F>(ctx: &Ctx, cb: F)
where
    F: FnOnce(Result<(u8, Vec<u8>)>) + 'static,
{
    let ctx2 = Rc::clone(ctx);
    readn(ctx, 3, move |header| {
        let header = match header {
            Ok(header) => header,
            Err(err) => {
                cb(Err(err));
                return;
            }
        };
        let ty = header[0];
        let length = u16::from_be_bytes([header[1], header[2]]) as usize;
        readn(&ctx2, length, move |payload| match payload {
            Ok(payload) => {
                debug!("< [{length}] type={ty}");
                cb(Ok((ty, payload)));
            }
            Err(err) => cb(Err(err)),
        });
    });
}

/// Reads one framed message and parses the payload as JSON.
pub(crate) fn read_json<F>(ctx: &Ctx, cb: F)
where
    F: FnOnce(Result<(u8, Value)>) + 'static,
{
    read_ll(ctx, move |message| {
        let (ty, payload) = match message {
            Ok(message) => message,
            Err(err) => {
                cb(Err(err));
                return;
            }
        };
        match serde_json::from_slice::<Value>(&payload) {
            Ok(value) => cb(Ok((ty, value))),
            Err(_) => cb(Err(Error::JsonParse)),
        }
    });
}

/// Reads one framed message and extracts the `"msg"` string from its JSON
/// payload.
pub(crate) fn read_msg<F>(ctx: &Ctx, cb: F)
where
    F: FnOnce(Result<(u8, String)>) + 'static,
{
    read_json(ctx, move |message| {
        let (ty, value) = match message {
            Ok(message) => message,
            Err(err) => {
                cb(Err(err));
                return;
            }
        };
        match value.get("msg").and_then(Value::as_str) {
            Some(msg) => cb(Ok((ty, msg.to_string()))),
            None => cb(Err(Error::JsonKey)),
        }
    });
}

/// Writes `data` on the control connection; `cb` fires once the buffer has
/// fully drained, or with the transport error that ended the attempt.
pub(crate) fn write<F>(ctx: &Ctx, data: Vec<u8>, cb: F)
where
    F: FnOnce(Result<()>) + 'static,
{
    let txp = match ctx.borrow().txp.clone() {
        Some(txp) => txp,
        None => {
            cb(Err(Error::Eof));
            return;
        }
    };
    write_txp(&txp, data, cb)
}

/// As [`write`], for an arbitrary transport (test connections included).
pub(crate) fn write_txp<F>(txp: &Transport, data: Vec<u8>, cb: F)
where
    F: FnOnce(Result<()>) + 'static,
{
    debug!("> [{}]", data.len());
    let slot: Rc<RefCell<Option<F>>> = Rc::new(RefCell::new(Some(cb)));
    {
        let slot = Rc::clone(&slot);
        txp.on_flush(move || {
            if let Some(cb) = slot.borrow_mut().take() {
                cb(Ok(()));
            }
        });
    }
    {
        let slot = Rc::clone(&slot);
        txp.on_error(move |err| {
            if let Some(cb) = slot.borrow_mut().take() {
                cb(Err(err));
            }
        });
    }
    txp.write(&data);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn framing_is_type_then_big_endian_length() {
        let frame = format_test_msg("x").unwrap();
        assert_eq!(frame[0], TEST_MSG);
        let len = u16::from_be_bytes([frame[1], frame[2]]) as usize;
        assert_eq!(len, frame.len() - 3);
        let value: Value = serde_json::from_slice(&frame[3..]).unwrap();
        assert_eq!(value["msg"], "x");
    }

    #[test]
    fn extended_login_announces_version_and_suite() {
        let frame = format_msg_extended_login(TEST_C2S | TEST_S2C | TEST_STATUS).unwrap();
        assert_eq!(frame[0], MSG_EXTENDED_LOGIN);
        let value: Value = serde_json::from_slice(&frame[3..]).unwrap();
        assert_eq!(value["msg"], NDT_VERSION);
        assert_eq!(value["tests"], (TEST_C2S | TEST_S2C | TEST_STATUS).to_string());
    }

    #[test]
    fn oversized_payload_is_rejected() {
        let big = "a".repeat(u16::MAX as usize);
        assert!(matches!(
            format_test_msg(&big),
            Err(Error::MessageTooLong)
        ));
    }

    #[test]
    fn waiting_reply_has_an_empty_msg() {
        let frame = format_msg_waiting().unwrap();
        assert_eq!(frame[0], MSG_WAITING);
        let value: Value = serde_json::from_slice(&frame[3..]).unwrap();
        assert_eq!(value["msg"], "");
    }
}
