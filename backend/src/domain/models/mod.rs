pub mod audit;
pub mod child;

pub use audit::*;
pub use child::*;
