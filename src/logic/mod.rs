pub mod branch_ops;
pub mod committed;
pub mod engine;
pub mod gc;
pub mod graph;
pub mod protection;
pub mod staging;

pub use branch_ops::ObjectStat;
pub use committed::{ChangeSet, CommittedManager, MetaRange};
pub use engine::*;
pub use gc::*;
pub use graph::{CommitGraph, CommitWalker};
pub use protection::{blocked_actions, glob_match, is_blocked};
pub use staging::StagingManager;
