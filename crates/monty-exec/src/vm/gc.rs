//! Mark/sweep collection of heap objects.
//!
//! Roots are the values the host passes in, the builtins namespace, every frame on
//! the executing call chain and the exceptions being handled. Suspended generator
//! frames are traced through the generator object that owns them.
//!
//! Unreachable generators that still hold a frame are closed before they are freed,
//! so their `finally` blocks run. Anything such a close makes reachable again is kept
//! for this cycle.

use crate::{
    frame::FrameId,
    heap::{HeapData, HeapId},
    tracer::CallTracer,
    value::Value,
};

use super::Vm;

impl<T: CallTracer> Vm<T> {
    /// Frees every heap object not reachable from `roots` or from the VM's own state.
    ///
    /// Returns the number of objects freed.
    pub fn collect_garbage(&mut self, roots: &[Value]) -> usize {
        let mut marked = self.mark(roots);

        let doomed: Vec<HeapId> = self
            .heap
            .ids()
            .filter(|id| !marked[id.index()])
            .filter(|id| {
                matches!(
                    self.heap.get(*id),
                    HeapData::Generator(generator) if generator.frame.is_some() && !generator.finalized
                )
            })
            .collect();
        if !doomed.is_empty() {
            tracing::debug!(count = doomed.len(), "finalizing unreachable generators");
            for id in doomed {
                self.finalize_generator(id);
            }
            marked = self.mark(roots);
        }

        let garbage: Vec<HeapId> = self.heap.ids().filter(|id| !marked[id.index()]).collect();
        for id in &garbage {
            if let Some(HeapData::Generator(generator)) = self.heap.release(*id)
                && let Some(frame) = generator.frame
            {
                self.frames.release(frame);
            }
        }
        tracing::debug!(freed = garbage.len(), live = self.heap.live_objects(), "collected garbage");
        garbage.len()
    }

    fn mark(&self, roots: &[Value]) -> Vec<bool> {
        let mut marked = vec![false; self.heap.capacity()];
        let mut pending: Vec<HeapId> = roots.iter().filter_map(Value::heap_id).collect();
        pending.push(self.builtins);

        let mut frame = self.current;
        while let Some(id) = frame {
            let state = self.frames.get(id);
            state.push_heap_ids(&mut pending);
            frame = state.back;
        }
        for exc in &self.handled {
            exc.push_heap_ids(&mut pending);
        }

        while let Some(id) = pending.pop() {
            let Some(seen) = marked.get_mut(id.index()) else {
                continue;
            };
            if *seen {
                continue;
            }
            *seen = true;
            let Some(data) = self.heap.try_get(id) else {
                continue;
            };
            data.push_children(&mut pending);
            if let HeapData::Generator(generator) = data
                && let Some(frame) = generator.frame
            {
                self.mark_frame(frame, &mut pending);
            }
        }
        marked
    }

    fn mark_frame(&self, frame: FrameId, pending: &mut Vec<HeapId>) {
        self.frames.get(frame).push_heap_ids(pending);
    }
}
