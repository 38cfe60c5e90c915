//! Flush lifecycle callbacks.

use crate::unit_of_work::PendingCounts;
use relmap_core::Error;

/// Unit of work lifecycle events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FlushEvent {
    /// Fired before cascades and change sets are computed.
    PreFlush,
    /// Fired once the commit plan is known, before any write.
    OnFlush,
    /// Fired after every write succeeded and snapshots were refreshed.
    PostFlush,
}

/// Arguments passed to flush callbacks.
#[derive(Debug, Clone, Copy)]
pub struct FlushEventArgs {
    pub event: FlushEvent,
    pub pending: PendingCounts,
}

/// Callbacks return `Err` to abort the commit; nothing has been written when
/// `PreFlush` or `OnFlush` callbacks fail.
type FlushEventFn = Box<dyn FnMut(&FlushEventArgs) -> Result<(), Error> + Send>;

/// Holds registered flush callbacks.
#[derive(Default)]
pub struct FlushEventCallbacks {
    pre_flush: Vec<FlushEventFn>,
    on_flush: Vec<FlushEventFn>,
    post_flush: Vec<FlushEventFn>,
}

impl std::fmt::Debug for FlushEventCallbacks {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FlushEventCallbacks")
            .field("pre_flush", &self.pre_flush.len())
            .field("on_flush", &self.on_flush.len())
            .field("post_flush", &self.post_flush.len())
            .finish()
    }
}

impl FlushEventCallbacks {
    pub fn register(
        &mut self,
        event: FlushEvent,
        f: impl FnMut(&FlushEventArgs) -> Result<(), Error> + Send + 'static,
    ) {
        self.slot(event).push(Box::new(f));
    }

    fn slot(&mut self, event: FlushEvent) -> &mut Vec<FlushEventFn> {
        match event {
            FlushEvent::PreFlush => &mut self.pre_flush,
            FlushEvent::OnFlush => &mut self.on_flush,
            FlushEvent::PostFlush => &mut self.post_flush,
        }
    }

    #[allow(clippy::result_large_err)]
    pub(crate) fn fire(&mut self, event: FlushEvent, pending: PendingCounts) -> Result<(), Error> {
        let args = FlushEventArgs { event, pending };
        for cb in self.slot(event).iter_mut() {
            cb(&args)?;
        }
        Ok(())
    }

    pub fn is_empty(&self) -> bool {
        self.pre_flush.is_empty() && self.on_flush.is_empty() && self.post_flush.is_empty()
    }
}
