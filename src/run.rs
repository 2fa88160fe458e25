//! Entry points for running a complete test against a server.

use crate::context::{Context, Settings};
use crate::error::{Error, Result};
use crate::protocol;
use crate::reactor::Reactor;
use crate::report::Entry;
use log::info;

/// Locates a nearby test server. The lookup runs on a background worker
/// thread, so implementations are free to block.
pub trait NameService: Send + 'static {
    /// Returns the hostname of a server suitable for `tool`, or a
    /// human-readable reason why none could be found.
    fn lookup(&self, tool: &str) -> std::result::Result<String, String>;
}

impl<T> NameService for T
where
    T: Fn(&str) -> std::result::Result<String, String> + Send + 'static,
{
    fn lookup(&self, tool: &str) -> std::result::Result<String, String> {
        self(tool)
    }
}

/// Runs the whole test suite against `address:port`.
///
/// The run is fully asynchronous: this returns immediately and `cb` fires
/// once, with the report on success, when the caller drives
/// [`Reactor::run`].
///
/// # Examples
///
/// ```no_run
/// use ndt_client::{Reactor, Settings};
///
/// let reactor = Reactor::new()?;
/// ndt_client::run_with_specific_server(
///     &reactor,
///     "ndt.example.org",
///     3001,
///     Settings::new(),
///     |result| match result {
///         Ok(entry) => println!("{entry}"),
///         Err(err) => eprintln!("test failed: {err}"),
///     },
/// );
/// reactor.run()?;
/// # Ok::<(), ndt_client::Error>(())
/// ```
pub fn run_with_specific_server<F>(
    reactor: &Reactor,
    address: &str,
    port: u16,
    settings: Settings,
    cb: F,
) where
    F: FnOnce(Result<Entry>) + 'static,
{
    let suite = match settings.test_suite() {
        Ok(suite) => suite,
        Err(err) => {
            cb(Err(err));
            return;
        }
    };
    let ctx = Context::new(
        reactor.clone(),
        address.to_string(),
        port,
        suite,
        Box::new(cb),
    );
    protocol::start(ctx);
}

/// As [`run_with_specific_server`], but the server is discovered first:
/// either taken from the `address` setting or asked of `name_service` on a
/// worker thread.
pub fn run<N, F>(reactor: &Reactor, settings: Settings, name_service: N, cb: F)
where
    N: NameService,
    F: FnOnce(Result<Entry>) + 'static,
{
    let port = match settings.port() {
        Ok(port) => port,
        Err(err) => {
            cb(Err(err));
            return;
        }
    };
    if let Some(address) = settings.get("address") {
        let address = address.to_string();
        run_with_specific_server(reactor, &address, port, settings, cb);
        return;
    }
    let tool = settings.mlabns_tool_name().to_string();
    reactor.run_in_background(
        move || name_service.lookup(&tool),
        move |reactor, resolved| match resolved {
            Ok(address) => {
                info!("discovered server {address}");
                run_with_specific_server(reactor, &address, port, settings, cb);
            }
            Err(reason) => cb(Err(Error::MlabnsQuery(reason))),
        },
    );
}
