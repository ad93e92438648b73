pub mod backoff;
pub mod factory;
pub mod iterator;
pub mod memory;
pub mod postgres;
pub mod record_cache;
pub mod traits;

pub use factory::*;
pub use iterator::*;
pub use memory::*;
pub use postgres::*;
pub use record_cache::*;
pub use traits::*;
