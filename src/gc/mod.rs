//! Mark-and-sweep memory manager.
//!
//! Every heap object is a leaked `Box<HeapObject>` whose value is recorded
//! in `heap`. Objects never move; `sweep` frees the ones the last marking
//! pass did not reach. Roots are supplied by the interpreter.

use crate::value::{Cleanup, HeapObject, Payload, Value};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct GcStats {
    pub collections: usize,
    pub freed: usize,
    pub live: usize,
    pub next_gc: usize,
}

pub struct MemoryManager {
    heap: Vec<Value>,
    next_gc: usize,
    initial_trigger: usize,
    grow_factor: f64,
    max_heap: usize,
    collections: usize,
    freed: usize,
}

impl MemoryManager {
    pub fn new(initial_trigger: usize, grow_factor: f64, max_heap: usize) -> Self {
        MemoryManager {
            heap: Vec::new(),
            next_gc: initial_trigger,
            initial_trigger,
            grow_factor,
            max_heap,
            collections: 0,
            freed: 0,
        }
    }

    /// Apply new tuning; takes effect from the next threshold check.
    pub fn configure(&mut self, initial_trigger: usize, grow_factor: f64, max_heap: usize) {
        if self.collections == 0 {
            self.next_gc = initial_trigger;
        }
        self.initial_trigger = initial_trigger;
        self.grow_factor = grow_factor;
        self.max_heap = max_heap;
    }

    /// Start tracking a new object. Taking the object by value means it
    /// can be recorded only once, so `sweep` frees it at most once.
    fn register(&mut self, object: HeapObject) -> Value {
        let value = object.into_value();
        self.heap.push(value);
        value
    }

    pub fn alloc(&mut self, payload: Payload) -> Value {
        self.register(HeapObject::new(payload))
    }

    pub fn alloc_with_cleanup(&mut self, payload: Payload, cleanup: Cleanup) -> Value {
        self.register(HeapObject::with_cleanup(payload, cleanup))
    }

    pub fn string(&mut self, s: impl Into<String>) -> Value {
        self.alloc(Payload::String(s.into()))
    }

    pub fn error(&mut self, msg: impl Into<String>) -> Value {
        self.alloc(Payload::Error(msg.into()))
    }

    pub fn list(&mut self, items: Vec<Value>) -> Value {
        self.alloc(Payload::List(items))
    }

    pub fn len(&self) -> usize {
        self.heap.len()
    }

    pub fn is_empty(&self) -> bool {
        self.heap.is_empty()
    }

    pub fn next_gc(&self) -> usize {
        self.next_gc
    }

    pub fn max_heap(&self) -> usize {
        self.max_heap
    }

    pub fn should_collect(&self) -> bool {
        self.heap.len() > self.next_gc
    }

    /// Heap still above the ceiling after a full cycle.
    pub fn is_exhausted(&self) -> bool {
        self.heap.len() > self.max_heap
    }

    /// Mark `value` and everything reachable from it.
    pub fn mark(&self, value: Value) {
        let mut worklist = vec![value];
        while let Some(v) = worklist.pop() {
            let Some(obj) = v.as_object() else { continue };
            if obj.is_marked() {
                continue;
            }
            obj.set_marked(true);
            obj.payload().for_each_child(|child| {
                if child.is_object() {
                    worklist.push(child);
                }
            });
        }
    }

    pub fn mark_range<I>(&self, values: I)
    where
        I: IntoIterator<Item = Value>,
    {
        for value in values {
            self.mark(value);
        }
    }

    /// Free every unmarked object and clear the marks of survivors.
    /// Returns the number of objects freed.
    pub fn sweep(&mut self) -> usize {
        let before = self.heap.len();
        self.heap.retain(|value| {
            let Some(obj) = value.as_object() else { return false };
            if obj.is_marked() {
                obj.set_marked(false);
                true
            } else {
                free_object(*value);
                false
            }
        });
        let freed = before - self.heap.len();
        self.collections += 1;
        self.freed += freed;

        let grown = (self.heap.len() as f64 * self.grow_factor) as usize;
        self.next_gc = grown.max(self.initial_trigger).min(self.max_heap);
        log::debug!(
            "gc #{}: {} -> {} objects, next at {}",
            self.collections,
            before,
            self.heap.len(),
            self.next_gc
        );
        freed
    }

    pub fn stats(&self) -> GcStats {
        GcStats {
            collections: self.collections,
            freed: self.freed,
            live: self.heap.len(),
            next_gc: self.next_gc,
        }
    }
}

fn free_object(value: Value) {
    let Some(ptr) = value.object_ptr() else { return };
    // SAFETY: every value in `heap` came from `HeapObject::into_value`, is
    // recorded exactly once, and is removed from `heap` as it is freed.
    let obj = unsafe { Box::from_raw(ptr.as_ptr()) };
    obj.release();
}

impl Drop for MemoryManager {
    fn drop(&mut self) {
        for value in self.heap.drain(..) {
            free_object(value);
        }
    }
}

#[cfg(test)]
mod tests {
    use std::ffi::c_void;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::value::Closure;

    fn manager() -> MemoryManager {
        MemoryManager::new(8, 2.0, 1 << 16)
    }

    #[test]
    fn unreachable_objects_are_freed() {
        let mut gc = manager();
        let kept = gc.string("kept");
        gc.string("garbage");
        gc.mark(kept);
        assert_eq!(gc.sweep(), 1);
        assert_eq!(gc.len(), 1);
        assert_eq!(kept.as_str().as_deref(), Some("kept"));
        assert!(!kept.as_object().unwrap().is_marked());
    }

    #[test]
    fn marking_traces_lists_and_maps() {
        let mut gc = manager();
        let inner = gc.string("inner");
        let list = gc.list(vec![inner, Value::int(3)]);
        let mut map = crate::value::Map::new();
        map.insert("xs".into(), list);
        let root = gc.alloc(Payload::Map(map));
        gc.string("dead");

        gc.mark(root);
        assert_eq!(gc.sweep(), 1);
        assert_eq!(gc.len(), 3);
        assert_eq!(inner.as_str().as_deref(), Some("inner"));
    }

    #[test]
    fn self_referencing_closures_are_collected() {
        let mut gc = manager();
        let closure = gc.alloc(Payload::Closure(Closure { function: Value::NULL, free: vec![Value::NULL] }));
        if let Payload::Closure(c) = &mut *closure.as_object().unwrap().payload_mut() {
            c.free[0] = closure;
        }
        gc.mark(closure);
        assert_eq!(gc.sweep(), 0);
        assert_eq!(gc.sweep(), 1);
        assert!(gc.is_empty());
    }

    #[test]
    fn mark_range_covers_every_root() {
        let mut gc = manager();
        let a = gc.string("a");
        let b = gc.string("b");
        gc.string("c");
        gc.mark_range([a, Value::int(1), b]);
        assert_eq!(gc.sweep(), 1);
    }

    static CLEANUPS: AtomicUsize = AtomicUsize::new(0);

    fn count_cleanup(_: *mut c_void) {
        CLEANUPS.fetch_add(1, Ordering::SeqCst);
    }

    #[test]
    fn cleanup_runs_once_unless_borrowed() {
        let mut gc = manager();
        let mut word = 0u64;
        let ptr = &mut word as *mut u64 as *mut c_void;
        gc.alloc_with_cleanup(Payload::Pointer(ptr), count_cleanup);
        let borrowed = gc.alloc_with_cleanup(Payload::Pointer(ptr), count_cleanup);
        borrowed.as_object().unwrap().set_ref(true);

        let before = CLEANUPS.load(Ordering::SeqCst);
        assert_eq!(gc.sweep(), 2);
        assert_eq!(CLEANUPS.load(Ordering::SeqCst) - before, 1);
    }

    #[test]
    fn every_allocation_is_tracked_once() {
        let mut gc = manager();
        let mut word = 0u64;
        let ptr = &mut word as *mut u64 as *mut c_void;
        gc.string("s");
        gc.list(Vec::new());
        gc.alloc_with_cleanup(Payload::Pointer(ptr), |_| {});
        assert_eq!(gc.len(), 3);
        assert_eq!(gc.sweep(), 3);
        assert_eq!(gc.sweep(), 0);
        assert!(gc.is_empty());
    }

    #[test]
    fn threshold_grows_with_live_heap() {
        let mut gc = MemoryManager::new(2, 2.0, 100);
        let items: Vec<Value> = (0..10).map(|i| gc.string(i.to_string())).collect();
        assert!(gc.should_collect());
        gc.mark_range(items.iter().copied());
        gc.sweep();
        assert_eq!(gc.next_gc(), 20);
        assert!(!gc.should_collect());
        let stats = gc.stats();
        assert_eq!(stats, GcStats { collections: 1, freed: 0, live: 10, next_gc: 20 });
    }

    #[test]
    fn threshold_is_capped_by_ceiling() {
        let mut gc = MemoryManager::new(1, 4.0, 12);
        let items: Vec<Value> = (0..10).map(|i| gc.string(i.to_string())).collect();
        gc.mark_range(items.iter().copied());
        gc.sweep();
        assert_eq!(gc.next_gc(), 12);
        assert!(!gc.is_exhausted());
    }
}
