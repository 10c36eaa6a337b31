mod buffer;
mod slot;
mod step;

pub use buffer::*;
pub use slot::*;
pub use step::*;
