mod tree;
mod types;

pub use tree::*;
pub use types::*;
