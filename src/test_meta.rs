//! The META test: after TEST_PREPARE and TEST_START we push a few
//! `key:value` TEST_MSGs describing this client, terminate the list with an
//! empty TEST_MSG, and wait for TEST_FINALIZE.

use crate::context::Ctx;
use crate::error::{Error, Result};
use crate::messages::{self, NDT_VERSION};
use log::{debug, info};
use std::rc::Rc;

pub(crate) fn run<F>(ctx: &Ctx, callback: F)
where
    F: FnOnce(Result<()>) + 'static,
{
    let ctx2 = Rc::clone(ctx);
    messages::read_msg(ctx, move |res| {
        let (ty, _) = match res {
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
        let ctx3 = Rc::clone(&ctx2);
        messages::read_msg(&ctx2, move |res| {
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

            // One buffer, one flush: the metadata lines plus the empty
            // message that terminates them.
            let frames = format_metadata();
            let frames = match frames {
                Ok(frames) => frames,
                Err(_) => {
                    callback(Err(Error::SerializingTestMsg));
                    return;
                }
            };
            debug!("sending metadata ({} bytes)", frames.len());
            let ctx4 = Rc::clone(&ctx3);
            messages::write(&ctx3, frames, move |res| {
                if let Err(err) = res {
                    callback(Err(Error::WritingTestMsg(Box::new(err))));
                    return;
                }
                info!("sent client metadata to server");
                messages::read_msg(&ctx4, move |res| {
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
                    callback(Ok(()));
                });
            });
        });
    });
}

fn format_metadata() -> Result<Vec<u8>> {
    let mut out = Vec::new();
    out.extend(messages::format_test_msg(&format!("client.version:{NDT_VERSION}"))?);
    out.extend(messages::format_test_msg("client.application:ndt-client")?);
    out.extend(messages::format_test_msg("")?);
    Ok(out)
}
