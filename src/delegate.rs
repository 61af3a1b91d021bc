use futures_util::future::BoxFuture;
use http_body_util::Full;
use hyper::body::{Bytes, Incoming};
use hyper::{Request, Response};

/// Outcome of consulting the pluggable request delegate before core routing (§6's "Control-plane
/// hook"): either the delegate fully answered the request, or core routing proceeds as if it
/// weren't consulted at all.
pub enum DelegateOutcome {
  Handled(Response<Full<Bytes>>),
  NotHandled,
}

/// The seam the admin HTTP/WebSocket control surface plugs into. Neither listener (C8, C9) knows
/// anything about that surface beyond this trait — it is an external collaborator referenced only
/// through this interface (§1's "out of scope" list). With no delegate installed, both listeners
/// fall straight through to their own routing.
pub trait RequestDelegate: Send + Sync {
  fn handle<'a>(&'a self, req: &'a Request<Incoming>) -> BoxFuture<'a, DelegateOutcome>;
}
