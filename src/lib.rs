pub mod cli;
pub mod config;
pub mod error;
pub mod infra;
pub mod logging;
pub mod model;
pub mod repository;
pub mod service;
pub mod sync;

pub use config::SyncConfig;
pub use error::{ErrorCode, Result, SyncError};
pub use model::*;
pub use service::{
    BadgeSync, MediaUpload, MediaUploadPipeline, ReceiptOutcome, ReceiptReconciler,
    TypingPresence, UnreadAggregator,
};
pub use sync::{
    Collaborators, DeletionFilter, FocusState, LoadState, MessageCache, SubscriptionManager,
    SyncEngine,
};
