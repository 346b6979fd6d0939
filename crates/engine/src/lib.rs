pub mod duration;
pub mod error;
pub mod ops;
pub mod planner;
pub mod reconcile;
pub mod render;
pub mod script;
pub mod status;
pub mod timeline;

pub use error::{AssemblyError, Stage};
pub use script::*;
pub use status::*;
pub use timeline::*;
