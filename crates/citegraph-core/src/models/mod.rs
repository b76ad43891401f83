pub mod identifiers;
pub mod publication;

pub use identifiers::*;
pub use publication::*;
