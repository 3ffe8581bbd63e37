//! Callback hooks for breaker transitions and rejected admissions

use std::sync::Arc;

type Hook = Arc<dyn Fn(&str) + Send + Sync>;

/// Optional hooks invoked with the command key
///
/// `on_reject` fires on every rejected admission, so fail-fast behavior
/// is observable without polling the metrics snapshot.
#[derive(Clone, Default)]
pub struct Callbacks {
    pub on_open: Option<Hook>,
    pub on_close: Option<Hook>,
    pub on_half_open: Option<Hook>,
    pub on_reject: Option<Hook>,
}

impl Callbacks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn trigger_open(&self, command: &str) {
        if let Some(ref callback) = self.on_open {
            callback(command);
        }
    }

    pub fn trigger_close(&self, command: &str) {
        if let Some(ref callback) = self.on_close {
            callback(command);
        }
    }

    pub fn trigger_half_open(&self, command: &str) {
        if let Some(ref callback) = self.on_half_open {
            callback(command);
        }
    }

    pub fn trigger_reject(&self, command: &str) {
        if let Some(ref callback) = self.on_reject {
            callback(command);
        }
    }
}

impl std::fmt::Debug for Callbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Callbacks")
            .field("on_open", &self.on_open.is_some())
            .field("on_close", &self.on_close.is_some())
            .field("on_half_open", &self.on_half_open.is_some())
            .field("on_reject", &self.on_reject.is_some())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn test_triggers_are_noops_without_hooks() {
        let callbacks = Callbacks::new();

        callbacks.trigger_open("add-customer");
        callbacks.trigger_close("add-customer");
        callbacks.trigger_half_open("add-customer");
        callbacks.trigger_reject("add-customer");
    }

    #[test]
    fn test_reject_hook_receives_command() {
        let rejections = Arc::new(AtomicUsize::new(0));
        let rejections_clone = rejections.clone();

        let callbacks = Callbacks {
            on_reject: Some(Arc::new(move |command| {
                assert_eq!(command, "add-customer");
                rejections_clone.fetch_add(1, Ordering::SeqCst);
            })),
            ..Callbacks::new()
        };

        callbacks.trigger_reject("add-customer");
        callbacks.trigger_reject("add-customer");
        assert_eq!(rejections.load(Ordering::SeqCst), 2);
    }
}
