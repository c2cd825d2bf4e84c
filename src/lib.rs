/*!
Static single-message HTTP server built on `mio`.

Every request, on any path and with any method, is answered with
`200 OK` and the body `Message from sample-app`.

```rust,no_run
extern crate sample_app;

fn main() {
    if let Err(e) = sample_app::start("0.0.0.0:8000", sample_app::respond) {
        eprintln!("Error: {}", e);
        ::std::process::exit(1);
    }
}
```

The server runs one `mio` event loop for all sockets and hands parsed
requests to a thread pool, so any `Fn(&Request) -> Response` can be
served in place of `respond`.
*/
#![recursion_limit="1024"]
#[macro_use] extern crate error_chain;
#[macro_use] extern crate log;
extern crate threadpool;
extern crate num_cpus;
extern crate mio;
extern crate slab;
extern crate httparse;
extern crate http;
extern crate httpdate;
extern crate libc;

pub mod errors;
mod http_stream;
mod response;
mod responder;
mod server;

pub use errors::{Error, ErrorKind, Result};
pub use http_stream::Limits;
pub use responder::{respond, MESSAGE};
pub use server::Server;


/// Incoming request with its whole body read
pub type Request = http::Request<Vec<u8>>;

/// What a handler returns
pub type Response = http::Response<Vec<u8>>;

/// A request whose body hasn't been read yet
pub(crate) type RequestHead = http::Request<()>;


/// Bind `addr` and serve `handler` forever.
///
/// Only returns on a fatal error: the address can't be bound
/// or the listener stops working.
pub fn start<F>(addr: &str, handler: F) -> Result<()>
    where F: Fn(&Request) -> Response + Send + Sync + 'static
{
    Server::bind(addr)?.serve(handler)
}
