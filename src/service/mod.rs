//! Utilities for working with `Service` types.

mod timeout;

pub use self::timeout::{Timeout, TimeoutFuture, TimeoutLayer};
pub use tower::{service_fn, Service, ServiceBuilder, ServiceExt};
