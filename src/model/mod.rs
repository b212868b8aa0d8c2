//! 数据模型模块

pub mod message;
pub mod tombstone;
pub mod typing;
pub mod unread;

pub use message::*;
pub use tombstone::*;
pub use typing::*;
pub use unread::*;
