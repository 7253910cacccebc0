pub mod memory;
pub mod postgres;
pub mod repository;

pub use memory::InMemoryMediaRepository;
pub use postgres::PgMediaRepository;
pub use repository::{MediaRepository, OwnerUsage};
