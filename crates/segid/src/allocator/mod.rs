mod config;
mod segment_allocator;
#[cfg(test)]
mod tests;

pub use config::*;
pub use segment_allocator::*;
