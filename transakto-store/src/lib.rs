mod document;
mod engine;
mod error;

pub use document::*;
pub use engine::*;
pub use error::*;
