mod dump;
mod ids;
mod lower;
mod module;
mod stmt;
mod subst;
mod verify;

pub use dump::*;
pub use ids::*;
pub use lower::*;
pub use module::*;
pub use stmt::*;
pub use subst::*;
pub use verify::*;
