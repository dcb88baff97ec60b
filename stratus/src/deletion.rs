// Fence tagged deferred destruction
//
// GPU resources may still be referenced by in-flight command buffers
// when the compositor is done with them, so nothing destroys a Vk
// handle in place. Resource wrappers enqueue a boxed guard here; the
// guard's Drop performs the actual vkDestroy and only runs once the
// fence of the frame that last referenced it has signaled.

use ash::vk;

use crate::Droppable;
use std::sync::Mutex;

struct PendingItem {
    /// The in-flight fence of the frame that was current when the item
    /// was scheduled. A null fence means no frame referenced the item
    /// and it may be dropped at the next drain.
    fence: vk::Fence,
    item: Box<dyn Droppable + Send>,
}

struct DeletionInner {
    /// Fence of the frame currently being recorded. Stamped onto every
    /// scheduled item.
    frame_fence: vk::Fence,
    /// Items waiting for their fence. Push order is preserved while
    /// draining, which is what keeps image views dying before their
    /// parent images: a texture enqueues its view guard before its
    /// image guard.
    pending: Vec<PendingItem>,
    /// Once the owning context starts tearing down the device has been
    /// idled, so scheduled items are dropped on the spot.
    immediate: bool,
}

/// The deferred destruction queue for one rendering context.
pub struct DeletionQueue {
    inner: Mutex<DeletionInner>,
}

impl DeletionQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(DeletionInner {
                frame_fence: vk::Fence::null(),
                pending: Vec::new(),
                immediate: false,
            }),
        }
    }

    /// Record the in-flight fence of the frame being recorded. All
    /// items scheduled until the next call are tagged with it.
    pub fn set_frame_fence(&self, fence: vk::Fence) {
        self.inner.lock().unwrap().frame_fence = fence;
    }

    /// Queue an item for destruction once the current frame retires.
    pub fn schedule(&self, item: Box<dyn Droppable + Send>) {
        let mut inner = self.inner.lock().unwrap();
        if inner.immediate {
            // device already idle, drop in place
            drop(item);
            return;
        }
        let fence = inner.frame_fence;
        inner.pending.push(PendingItem {
            fence: fence,
            item: item,
        });
    }

    /// Drop every pending item whose fence has signaled.
    ///
    /// Called once per frame from the renderer, before new resources
    /// are allocated.
    pub fn drain(&self, dev: &ash::Device) {
        self.drain_where(|fence| {
            if fence == vk::Fence::null() {
                return true;
            }
            unsafe { dev.get_fence_status(fence).unwrap_or(true) }
        });
    }

    /// Drop every pending item, regardless of fence state.
    ///
    /// Only valid after vkDeviceWaitIdle; also flips the queue into
    /// immediate mode so that guards scheduled during teardown do not
    /// linger.
    pub fn drain_all(&self) {
        let mut inner = self.inner.lock().unwrap();
        inner.immediate = true;
        inner.pending.clear();
    }

    /// Drain with a caller supplied signal check. Split out from
    /// `drain` so the retirement logic does not need a live device.
    pub(crate) fn drain_where<F: Fn(vk::Fence) -> bool>(&self, is_signaled: F) {
        let mut inner = self.inner.lock().unwrap();
        // retain drops the rejected guards in push order
        inner.pending.retain(|p| !is_signaled(p.fence));
    }

    #[cfg(test)]
    pub(crate) fn pending_count(&self) -> usize {
        self.inner.lock().unwrap().pending.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ash::vk::Handle;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Arc;

    /// Guard that records its drop order into a shared list
    struct Recorder {
        order: Arc<Mutex<Vec<&'static str>>>,
        name: &'static str,
    }

    impl Drop for Recorder {
        fn drop(&mut self) {
            self.order.lock().unwrap().push(self.name);
        }
    }

    struct Counter(Arc<AtomicUsize>);
    impl Drop for Counter {
        fn drop(&mut self) {
            self.0.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn items_survive_until_fence_signals() {
        let queue = DeletionQueue::new();
        let drops = Arc::new(AtomicUsize::new(0));

        queue.set_frame_fence(vk::Fence::from_raw(1));
        queue.schedule(Box::new(Counter(drops.clone())));
        queue.schedule(Box::new(Counter(drops.clone())));

        // fence 1 not yet signaled
        queue.drain_where(|_| false);
        assert_eq!(drops.load(Ordering::SeqCst), 0);
        assert_eq!(queue.pending_count(), 2);

        queue.drain_where(|f| f == vk::Fence::from_raw(1));
        assert_eq!(drops.load(Ordering::SeqCst), 2);
        assert_eq!(queue.pending_count(), 0);
    }

    #[test]
    fn null_fence_items_drop_at_next_drain() {
        let queue = DeletionQueue::new();
        let drops = Arc::new(AtomicUsize::new(0));

        queue.schedule(Box::new(Counter(drops.clone())));
        queue.drain_where(|f| f == vk::Fence::null());
        assert_eq!(drops.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn drop_order_is_push_order() {
        let queue = DeletionQueue::new();
        let order = Arc::new(Mutex::new(Vec::new()));

        queue.set_frame_fence(vk::Fence::from_raw(7));
        // a texture pushes its view guard before its image guard
        queue.schedule(Box::new(Recorder {
            order: order.clone(),
            name: "view",
        }));
        queue.schedule(Box::new(Recorder {
            order: order.clone(),
            name: "image",
        }));

        queue.drain_where(|_| true);
        assert_eq!(*order.lock().unwrap(), vec!["view", "image"]);
    }

    #[test]
    fn immediate_mode_drops_on_schedule() {
        let queue = DeletionQueue::new();
        let drops = Arc::new(AtomicUsize::new(0));

        queue.drain_all();
        queue.schedule(Box::new(Counter(drops.clone())));
        assert_eq!(drops.load(Ordering::SeqCst), 1);
        assert_eq!(queue.pending_count(), 0);
    }
}
