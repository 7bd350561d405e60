use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum HostEventKind {
    VisibilityChange,
    PageHide,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HostEvent {
    VisibilityChange { visible: bool },
    PageHide,
}

impl HostEvent {
    pub fn kind(&self) -> HostEventKind {
        match self {
            HostEvent::VisibilityChange { .. } => HostEventKind::VisibilityChange,
            HostEvent::PageHide => HostEventKind::PageHide,
        }
    }
}

pub type HostListener = Arc<dyn Fn(HostEvent) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ListenerId(pub u64);

/// The embedding application: a browser tab, a desktop window, a mobile
/// app lifecycle.
pub trait HostEnvironment: Send + Sync {
    fn add_listener(&self, kind: HostEventKind, listener: HostListener) -> ListenerId;

    fn remove_listener(&self, kind: HostEventKind, id: ListenerId);

    fn is_visible(&self) -> bool;
}

/// Listeners the manager installed on a host.
pub(crate) struct HostBinding {
    host: Arc<dyn HostEnvironment>,
    visibility: ListenerId,
    page_hide: ListenerId,
}

impl HostBinding {
    pub(crate) fn bind(host: Arc<dyn HostEnvironment>, listener: HostListener) -> Self {
        let visibility = host.add_listener(HostEventKind::VisibilityChange, Arc::clone(&listener));
        let page_hide = host.add_listener(HostEventKind::PageHide, listener);
        Self {
            host,
            visibility,
            page_hide,
        }
    }

    pub(crate) fn unbind(self) {
        self.host
            .remove_listener(HostEventKind::VisibilityChange, self.visibility);
        self.host.remove_listener(HostEventKind::PageHide, self.page_hide);
    }
}
