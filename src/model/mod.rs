pub mod codec;
pub mod commit;
pub mod common;
pub mod keys;
pub mod merge;
pub mod repository;
pub mod rules;
pub mod staged;
pub mod tags;

pub use commit::*;
pub use common::*;
pub use merge::*;
pub use repository::*;
pub use rules::*;
pub use staged::*;
pub use tags::*;
