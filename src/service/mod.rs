// 业务服务层模块
pub mod badge_sync;
pub mod media_upload;
pub mod receipt_reconciler;
pub mod typing_presence;
pub mod unread_aggregator;

pub use badge_sync::BadgeSync;
pub use media_upload::{MediaUpload, MediaUploadPipeline};
pub use receipt_reconciler::{ReceiptOutcome, ReceiptReconciler};
pub use typing_presence::{TypingPresence, TypingState, DEFAULT_TYPING_TIMEOUT};
pub use unread_aggregator::UnreadAggregator;
