pub use domain::*;

pub mod domain;
pub mod units;
