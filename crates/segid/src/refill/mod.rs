mod pool;
mod request;
mod worker;

pub use pool::*;
pub use request::*;
pub use worker::*;

pub(crate) use worker::fetch_with_retry;
