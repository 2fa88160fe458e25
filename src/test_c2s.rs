//! The upload (C2S) test.
//!
//! Message order: TEST_PREPARE with the test port, TEST_START once we are
//! connected, the upload itself, a TEST_MSG with the speed the server
//! measured, then TEST_FINALIZE. The server is the receiver here, so its
//! measurement is the authoritative one.

use crate::context::Ctx;
use crate::error::{Error, Result};
use crate::messages;
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
        debug!("upload test: {params:?}");
        let record = Rc::new(RefCell::new(params.to_record()));

        let ctx3 = Rc::clone(&ctx2);
        let rec = Rc::clone(&record);
        streams::connect_streams(&ctx2, Direction::Upload, params, rec, move |res| {
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
                    let local_speed = match res {
                        Ok(speed) => speed,
                        Err(err) => {
                            callback(Err(err));
                            return;
                        }
                    };
                    debug!("upload pushed at {local_speed:.2} kbit/s locally");

                    let ctx6 = Rc::clone(&ctx5);
                    messages::read_msg(&ctx5, move |res| {
                        let (ty, msg) = match res {
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
                        info!("upload speed measured by server: {msg} kbit/s");
                        if let Ok(speed) = msg.trim().parse::<f64>() {
                            record.borrow_mut().set("speed_kbit_s", speed);
                        }

                        let ctx7 = Rc::clone(&ctx6);
                        messages::read_msg(&ctx6, move |res| {
                            let (ty, _) = match res {
                                Ok(message) => message,
                                Err(err) => {
                                    callback(Err(Error::ReadingTestFinalize(Box::new(err))));
                                    return;
                                }
                            };
                            if ty != messages::TEST_FINALIZE {
                                callback(Err(Error::NotTestFinalize(ty)));
                                return;
                            }
                            let finished = record.borrow().as_json();
                            ctx7.borrow_mut().entry.push("test_c2s", finished);
                            callback(Ok(()));
                        });
                    });
                });
                resume(done);
            });
        });
    });
}
