mod arraystr;
pub mod directories;

pub use arraystr::{ArrayStr, ArrayStrTooLong};
