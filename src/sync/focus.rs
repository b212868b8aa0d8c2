use parking_lot::RwLock;
use std::sync::atomic::{AtomicBool, Ordering};

/// 应用前后台 + 当前聚焦会话
///
/// 会话"聚焦" = 应用在前台且该会话是当前打开的会话。
#[derive(Debug)]
pub struct FocusState {
    foreground: AtomicBool,
    active: RwLock<Option<String>>,
}

impl Default for FocusState {
    fn default() -> Self {
        Self::new(true)
    }
}

impl FocusState {
    pub fn new(foreground: bool) -> Self {
        Self {
            foreground: AtomicBool::new(foreground),
            active: RwLock::new(None),
        }
    }

    pub fn is_foreground(&self) -> bool {
        self.foreground.load(Ordering::SeqCst)
    }

    pub fn set_foreground(&self, foreground: bool) {
        self.foreground.store(foreground, Ordering::SeqCst);
    }

    pub fn active_conversation(&self) -> Option<String> {
        self.active.read().clone()
    }

    pub fn set_active(&self, conversation_id: Option<String>) {
        *self.active.write() = conversation_id;
    }

    /// 仅当 `conversation_id` 仍是当前会话时清除
    pub fn clear_if_active(&self, conversation_id: &str) -> bool {
        let mut active = self.active.write();
        if active.as_deref() == Some(conversation_id) {
            *active = None;
            return true;
        }
        false
    }

    pub fn is_focused(&self, conversation_id: &str) -> bool {
        self.is_foreground() && self.active.read().as_deref() == Some(conversation_id)
    }
}
