//! Deferred destruction queue
//!
//! GPU objects cannot be freed while a submitted command buffer may still
//! reference them. Destroy paths push a cleanup closure tagged with the
//! submission that last could have used the object; the closure runs once
//! that submission has retired.

use std::collections::VecDeque;

use super::immediate::{SubmissionTimeline, SubmitHandle};
use crate::render::backends::vulkan::VulkanResult;

struct DeferredTask {
    task: Box<dyn FnOnce()>,
    handle: SubmitHandle,
}

/// FIFO of cleanup closures gated on submission retirement
#[derive(Default)]
pub struct DeferredTaskQueue {
    tasks: VecDeque<DeferredTask>,
}

impl DeferredTaskQueue {
    /// Create an empty queue
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue `task` to run after `handle` retires
    pub fn push(&mut self, task: impl FnOnce() + 'static, handle: SubmitHandle) {
        self.tasks.push_back(DeferredTask {
            task: Box::new(task),
            handle,
        });
    }

    /// Run tasks from the front while their submissions have retired
    ///
    /// Uses the fast check only and stops at the first pending task, so the
    /// cost per call stays small. Returns how many tasks ran.
    pub fn process<T: SubmissionTimeline + ?Sized>(&mut self, timeline: &T) -> usize {
        let mut executed = 0;
        while let Some(front) = self.tasks.front() {
            if !timeline.is_ready(front.handle, true) {
                break;
            }
            if let Some(DeferredTask { task, .. }) = self.tasks.pop_front() {
                task();
                executed += 1;
            }
        }
        executed
    }

    /// Wait for and run every queued task in order
    ///
    /// A failed wait is logged and the task still runs; the first error is
    /// returned after the queue is empty.
    pub fn wait_all<T: SubmissionTimeline + ?Sized>(
        &mut self,
        timeline: &mut T,
    ) -> VulkanResult<()> {
        let mut first_error = None;
        while let Some(DeferredTask { task, handle }) = self.tasks.pop_front() {
            if let Err(e) = timeline.wait(handle) {
                log::error!("Failed to wait for {:?} before deferred cleanup: {}", handle, e);
                first_error.get_or_insert(e);
            }
            task();
        }
        first_error.map_or(Ok(()), Err)
    }

    /// Number of pending tasks
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// True when nothing is pending
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::collections::HashSet;
    use std::rc::Rc;

    /// Timeline whose retirement is driven by the test
    #[derive(Default)]
    pub(crate) struct ScriptedTimeline {
        pub retired: HashSet<u32>,
        pub waited: Vec<SubmitHandle>,
        pub last: SubmitHandle,
    }

    impl ScriptedTimeline {
        pub fn retire(&mut self, submit_id: u32) {
            self.retired.insert(submit_id);
        }
    }

    impl SubmissionTimeline for ScriptedTimeline {
        fn is_ready(&self, handle: SubmitHandle, _fast_check: bool) -> bool {
            handle.is_empty() || self.retired.contains(&handle.submit_id)
        }

        fn wait(&mut self, handle: SubmitHandle) -> VulkanResult<()> {
            self.waited.push(handle);
            if !handle.is_empty() {
                self.retired.insert(handle.submit_id);
            }
            Ok(())
        }

        fn last_submit_handle(&self) -> SubmitHandle {
            self.last
        }
    }

    fn recorder() -> (Rc<RefCell<Vec<u32>>>, impl Fn(u32) -> Box<dyn FnOnce()>) {
        let log = Rc::new(RefCell::new(Vec::new()));
        let log_clone = log.clone();
        let make = move |id: u32| -> Box<dyn FnOnce()> {
            let log = log_clone.clone();
            Box::new(move || log.borrow_mut().push(id))
        };
        (log, make)
    }

    #[test]
    fn test_empty_handle_runs_on_next_process() {
        let (log, make) = recorder();
        let mut queue = DeferredTaskQueue::new();
        queue.push(make(1), SubmitHandle::default());

        assert_eq!(queue.process(&ScriptedTimeline::default()), 1);
        assert_eq!(*log.borrow(), vec![1]);
        assert!(queue.is_empty());
    }

    /// A pending front task blocks later tasks even if they have retired
    #[test]
    fn test_front_blocks_later_tasks() {
        let (log, make) = recorder();
        let mut queue = DeferredTaskQueue::new();
        let mut timeline = ScriptedTimeline::default();

        queue.push(make(1), SubmitHandle::new(0, 10));
        queue.push(make(2), SubmitHandle::new(1, 11));
        timeline.retire(11);

        assert_eq!(queue.process(&timeline), 0);
        assert!(log.borrow().is_empty());
        assert_eq!(queue.len(), 2);

        timeline.retire(10);
        assert_eq!(queue.process(&timeline), 2);
        assert_eq!(*log.borrow(), vec![1, 2]);
    }

    #[test]
    fn test_process_stops_at_first_pending() {
        let (log, make) = recorder();
        let mut queue = DeferredTaskQueue::new();
        let mut timeline = ScriptedTimeline::default();

        queue.push(make(1), SubmitHandle::new(0, 1));
        queue.push(make(2), SubmitHandle::new(1, 2));
        queue.push(make(3), SubmitHandle::new(2, 3));
        timeline.retire(1);

        assert_eq!(queue.process(&timeline), 1);
        assert_eq!(*log.borrow(), vec![1]);
        assert_eq!(queue.len(), 2);
    }

    #[test]
    fn test_wait_all_runs_everything_in_order() {
        let (log, make) = recorder();
        let mut queue = DeferredTaskQueue::new();
        let mut timeline = ScriptedTimeline::default();

        queue.push(make(1), SubmitHandle::new(0, 5));
        queue.push(make(2), SubmitHandle::default());
        queue.push(make(3), SubmitHandle::new(3, 7));

        queue.wait_all(&mut timeline).unwrap();

        assert_eq!(*log.borrow(), vec![1, 2, 3]);
        assert_eq!(
            timeline.waited,
            vec![SubmitHandle::new(0, 5), SubmitHandle::default(), SubmitHandle::new(3, 7)]
        );
        assert!(queue.is_empty());
    }
}
