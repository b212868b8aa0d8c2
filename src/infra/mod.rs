// Infrastructure layer - 基础设施层
// 外部协作者接口（查询、实时频道、媒体、角标）及其实现，外加进程级设施

pub mod badge;
pub mod media;
pub mod memory;
pub mod metrics;
pub mod query;
pub mod realtime;
pub mod rest;
pub mod settings_cache;

// 重新导出主要类型
pub use badge::{BadgeApi, UnsupportedBadge};
pub use media::MediaStorage;
pub use memory::{MemoryRealtime, MemoryStore, RecordingBadge};
pub use query::{Filter, Order, Query, QueryClient};
pub use realtime::{
    ChangeKind, ChannelBinding, ChannelHandle, ChannelSpec, ChannelState, RealtimeEvent,
    RealtimeTransport, Subscription,
};
pub use rest::RestClient;
pub use settings_cache::{RemoteSettings, SettingsCache};
