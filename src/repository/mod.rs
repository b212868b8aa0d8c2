//! 仓库层：在查询协作者之上提供强类型的行访问，并在边界处校验行结构

pub mod message_repo;
pub mod tombstone_repo;

pub use message_repo::{MessageRepository, UnreadRef};
pub use tombstone_repo::TombstoneRepository;
