mod interface;
mod memory;
#[cfg(feature = "postgres")]
mod postgres;

pub use interface::*;
pub use memory::*;
#[cfg_attr(docsrs, doc(cfg(feature = "postgres")))]
#[cfg(feature = "postgres")]
pub use postgres::*;
