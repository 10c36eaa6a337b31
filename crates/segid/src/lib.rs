#![doc = include_str!("../README.md")]

mod allocator;
mod coordination;
mod error;
mod refill;
mod segment;
mod store;

pub use crate::allocator::*;
pub use crate::coordination::*;
pub use crate::error::*;
pub use crate::refill::*;
pub use crate::segment::*;
pub use crate::store::*;
