//! 会话同步：缓存、删除过滤、订阅管理与引擎

pub mod deletion_filter;
pub mod engine;
pub mod focus;
pub mod message_cache;
pub mod subscription_manager;

pub use deletion_filter::DeletionFilter;
pub use engine::{Collaborators, SyncEngine};
pub use focus::FocusState;
pub use message_cache::{MergeOutcome, MessageCache, SharedCache};
pub use subscription_manager::{
    ConversationKey, LoadState, SubscriptionManager, SyncDeps, SyncOptions,
};
