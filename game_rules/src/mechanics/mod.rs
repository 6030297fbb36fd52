//! Game mechanics: dice notation and roll resolution.

mod dice;

pub use dice::*;
