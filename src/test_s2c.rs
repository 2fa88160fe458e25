//! The download (S2C) test.
//!
//! Message order: TEST_PREPARE with transfer parameters, TEST_START once we
//! are connected, the transfer itself, a TEST_MSG with the server's
//! throughput report, our own measurement echoed back, then zero or more
//! TEST_MSGs with web100 variables until TEST_FINALIZE.

use crate::context::Ctx;
use crate::error::{Error, Result};
use crate::messages;
use crate::report::Entry;
use crate::streams::{self, Direction, Params, StreamsDone};
use log::{debug, info};
use std::cell::RefCell;
use std::rc::Rc;

pub(crate) fn run<F>(ctx: &Ctx, callback: F)
where
    F: FnOnce(Result<()>) + 'static,
{
    let ctx2 = Rc::clone(ctx);
    messages::read_msg(ctx, move |res| {
        let (ty, msg) = match res {
            Ok(message) => message,
            Err(err) => {
                callback(Err(Error::ReadingTestPrepare(Box::new(err))));
                return;
            }
        };
        if ty != messages::TEST_PREPARE {
            callback(Err(Error::NotTestPrepare(ty)));
            return;
        }
        let params = match Params::parse(&msg) {
            Ok(params) => params,
            Err(err) => {
                callback(Err(err));
                return;
            }
        };
        debug!("download test: {params:?}");
        let record = Rc::new(RefCell::new(params.to_record()));

        let ctx3 = Rc::clone(&ctx2);
        let rec = Rc::clone(&record);
        streams::connect_streams(&ctx2, Direction::Download, params, rec, move |res| {
            let resume = match res {
                Ok(resume) => resume,
                Err(err) => {
                    callback(Err(err));
                    return;
                }
            };
            let ctx4 = Rc::clone(&ctx3);
            messages::read_msg(&ctx3, move |res| {
                let (ty, _) = match res {
                    Ok(message) => message,
                    Err(err) => {
                        callback(Err(Error::ReadingTestStart(Box::new(err))));
                        return;
                    }
                };
                if ty != messages::TEST_START {
                    callback(Err(Error::NotTestStart(ty)));
                    return;
                }

                let ctx5 = Rc::clone(&ctx4);
                let done: StreamsDone = Box::new(move |res| {
                    let speed = match res {
                        Ok(speed) => speed,
                        Err(err) => {
                            callback(Err(err));
                            return;
                        }
                    };
                    info!("download complete: {speed:.2} kbit/s");
                    record.borrow_mut().set("speed_kbit_s", speed);

                    let ctx6 = Rc::clone(&ctx5);
                    messages::read_json(&ctx5, move |res| {
                        let (ty, value) = match res {
                            Ok(message) => message,
                            Err(err) => {
                                callback(Err(Error::ReadingTestMsg(Box::new(err))));
                                return;
                            }
                        };
                        if ty != messages::TEST_MSG {
                            callback(Err(Error::NotTestMsg(ty)));
                            return;
                        }
                        debug!("server throughput report: {value}");

                        let frame = match messages::format_test_msg(&speed.to_string()) {
                            Ok(frame) => frame,
                            Err(_) => {
                                callback(Err(Error::SerializingTestMsg));
                                return;
                            }
                        };
                        let ctx7 = Rc::clone(&ctx6);
                        messages::write(&ctx6, frame, move |res| {
                            if let Err(err) = res {
                                callback(Err(Error::WritingTestMsg(Box::new(err))));
                                return;
                            }
                            finalize(ctx7, record, callback);
                        });
                    });
                });
                resume(done);
            });
        });
    });
}

/// Collects web100 `name: value` lines until the server finalizes the test,
/// then files the finished record under `test_s2c`.
fn finalize<F>(ctx: Ctx, record: Rc<RefCell<Entry>>, callback: F)
where
    F: FnOnce(Result<()>) + 'static,
{
    let next = Rc::clone(&ctx);
    messages::read_msg(&ctx, move |res| {
        let (ty, msg) = match res {
            Ok(message) => message,
            Err(err) => {
                callback(Err(Error::ReadingTestMsg(Box::new(err))));
                return;
            }
        };
        match ty {
            messages::TEST_FINALIZE => {
                let finished = record.borrow().as_json();
                next.borrow_mut().entry.push("test_s2c", finished);
                callback(Ok(()));
            }
            messages::TEST_MSG => {
                let mut r = record.borrow_mut();
                for line in msg.lines().filter(|line| !line.is_empty()) {
                    if let Some((name, value)) = line.split_once(':') {
                        r.set_nested("web100_data", name.trim(), value.trim());
                    }
                }
                drop(r);
                finalize(next, record, callback);
            }
            other => callback(Err(Error::NotTestMsg(other))),
        }
    });
}
