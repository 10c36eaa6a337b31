mod interface;
mod local;
mod maintenance;
#[cfg(feature = "postgres")]
mod postgres;

pub use interface::*;
pub use local::*;
pub use maintenance::*;
#[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
#[cfg(feature = "postgres")]
pub use postgres::*;
