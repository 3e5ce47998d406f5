//! Thread Contexts
//!
//! A context is the per-OS-thread view of an instance: the current
//! allocation page, the exception slot, the register-stack chain, the
//! local root lists and the GC state machine. Registering a context
//! makes its roots visible to the collector; a context must not be
//! used after its thread unregisters (enforced by ownership: dropping
//! the context unregisters).

use std::sync::Arc;
use std::sync::atomic::{AtomicPtr, AtomicU32, Ordering};

use parking_lot::Mutex;

use crate::error::{ExcKind, Raised};
use crate::gc::{self, GcStats};
use crate::heap::{Page, LARGE_OBJECT_THRESHOLD};
use crate::object::{HeapObject, ObjBody, TypeTag};
use crate::runtime::locals::{Local, LocalRoots, ULocal};
use crate::runtime::Instance;
use crate::value::{Value, ValueCell};

/// GC-visible thread states.
pub(crate) const THREAD_RUNNING: u32 = 0;
pub(crate) const THREAD_PARKED: u32 = 1;
pub(crate) const THREAD_SUSPENDED: u32 = 2;

/// Shared per-thread state; the collector reads it while the thread is
/// parked or suspended.
pub(crate) struct ThreadState {
    pub(crate) gc_state: AtomicU32,
    pub(crate) exception: ValueCell,
    /// Topmost stack object of the register chain, or `BAD` before the
    /// first call.
    pub(crate) stack: ValueCell,
    /// Index of the current frame's first register within that stack.
    pub(crate) regs_idx: AtomicU32,
    pub(crate) stack_depth: AtomicU32,
    pub(crate) locals: Mutex<LocalRoots>,
    pub(crate) cur_page: Mutex<Option<Arc<Page>>>,
    /// Body of an in-flight allocation; traced and updated like a root
    /// so a collection during the slow path cannot strand it.
    pub(crate) pending_body: AtomicPtr<ObjBody>,
}

impl std::fmt::Debug for ThreadState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ThreadState")
            .field("gc_state", &self.gc_state.load(Ordering::Relaxed))
            .finish()
    }
}

impl ThreadState {
    fn new() -> ThreadState {
        ThreadState {
            gc_state: AtomicU32::new(THREAD_RUNNING),
            exception: ValueCell::bad(),
            stack: ValueCell::bad(),
            regs_idx: AtomicU32::new(0),
            stack_depth: AtomicU32::new(0),
            locals: Mutex::new(LocalRoots::default()),
            cur_page: Mutex::new(None),
            pending_body: AtomicPtr::new(std::ptr::null_mut()),
        }
    }

    /// Visit this thread's roots. Called by the collector while the
    /// thread cannot mutate them.
    pub(crate) fn trace(&self, visit: &mut dyn FnMut(Value)) {
        visit(self.exception.get());
        visit(self.stack.get());
        self.locals.lock().trace(visit);

        let pending = self.pending_body.load(Ordering::Acquire);
        if !pending.is_null() {
            // The owning thread is parked inside the allocation slow
            // path, so the body it published outlives this cycle.
            unsafe { (*pending).trace(visit) };
        }
    }

    pub(crate) fn update_refs(&self, remap: &dyn Fn(Value) -> Value) {
        self.exception.set(remap(self.exception.get()));
        self.stack.set(remap(self.stack.get()));
        self.locals.lock().update_refs(remap);

        let pending = self.pending_body.load(Ordering::Acquire);
        if !pending.is_null() {
            unsafe { (*pending).update_refs(remap) };
        }
    }
}

/// Per-thread handle to a running instance.
pub struct Context {
    pub(crate) instance: Arc<Instance>,
    pub(crate) state: Arc<ThreadState>,
}

impl Context {
    /// Register the calling thread with the instance.
    pub(crate) fn register(instance: Arc<Instance>) -> Context {
        let state = Arc::new(ThreadState::new());
        instance.threads.contexts.lock().push(state.clone());
        Context { instance, state }
    }

    pub fn instance(&self) -> &Instance {
        &self.instance
    }

    pub fn instance_arc(&self) -> Arc<Instance> {
        self.instance.clone()
    }

    // === Singletons ===

    pub fn void_val(&self) -> Value {
        self.instance.consts.void.get()
    }

    pub fn true_val(&self) -> Value {
        self.instance.consts.bool_true.get()
    }

    pub fn false_val(&self) -> Value {
        self.instance.consts.bool_false.get()
    }

    pub fn bool_val(&self, value: bool) -> Value {
        if value {
            self.true_val()
        } else {
            self.false_val()
        }
    }

    // === Type queries ===

    /// Type of a value. Small integers are integers; heap values are
    /// classified by their header.
    pub fn type_of(&self, value: Value) -> TypeTag {
        if value.is_small_int() {
            return TypeTag::Integer;
        }
        debug_assert!(!value.is_bad(), "type_of on the bad sentinel");
        match self.resolve(value) {
            Some(obj) => obj.header.tag(),
            None => TypeTag::Void,
        }
    }

    /// Resolve a heap value to its object; `None` for immediates and
    /// stale handles.
    pub fn resolve(&self, value: Value) -> Option<Arc<HeapObject>> {
        if !value.is_heap() {
            return None;
        }
        self.instance.heap.resolve(value.handle())
    }

    /// Resolve, raising `TypeError` for immediates. A dangling handle
    /// is a runtime defect and raises `InvalidValue`.
    pub fn obj(&self, value: Value) -> Result<Arc<HeapObject>, Raised> {
        if !value.is_heap() {
            return Err(self.raise_kind(ExcKind::TypeError, "value has no object representation"));
        }
        match self.instance.heap.resolve(value.handle()) {
            Some(obj) => Ok(obj),
            None => {
                debug_assert!(false, "stale handle {:?}", value);
                Err(self.raise_kind(ExcKind::InvalidValue, "stale object reference"))
            }
        }
    }

    // === Exceptions ===

    pub fn is_exception_pending(&self) -> bool {
        !self.state.exception.get().is_bad()
    }

    pub fn get_exception(&self) -> Value {
        self.state.exception.get()
    }

    pub fn clear_exception(&self) {
        self.state.exception.set(Value::BAD);
    }

    /// Set the pending exception to an arbitrary value. A new
    /// exception overwrites a pending one.
    pub fn raise(&self, value: Value) -> Raised {
        self.state.exception.set(value);
        Raised
    }

    /// Raise a kind-tagged exception with a message.
    pub fn raise_kind(&self, kind: ExcKind, message: &str) -> Raised {
        let text = format!("{}: {}", kind.as_str(), message);
        match crate::object::string::new_string(self, &text) {
            Ok(value) => self.raise(value),
            // The string allocation failed and already raised
            // out-of-memory.
            Err(raised) => raised,
        }
    }

    /// Raise from a C-style message string.
    pub fn raise_str(&self, message: &str) -> Raised {
        match crate::object::string::new_string(self, message) {
            Ok(value) => self.raise(value),
            Err(raised) => raised,
        }
    }

    /// Raise with printf-style formatting.
    pub fn raise_fmt(&self, args: std::fmt::Arguments<'_>) -> Raised {
        self.raise_str(&args.to_string())
    }

    /// Raise the preallocated out-of-memory exception. Never
    /// allocates.
    pub(crate) fn raise_oom(&self) -> Raised {
        self.raise(self.instance.consts.out_of_memory.get())
    }

    /// Raise the generator-end marker.
    pub(crate) fn raise_generator_end(&self) -> Raised {
        self.raise_kind(ExcKind::GeneratorEnd, "generator finished")
    }

    /// Kind tag of the pending exception, when it carries one. Sees
    /// through exception objects wrapped with a backtrace.
    pub fn exception_kind(&self) -> Option<ExcKind> {
        let mut exc = self.state.exception.get();
        if !exc.is_heap() {
            return None;
        }
        if let Some(obj) = self.resolve(exc) {
            if let ObjBody::Object(o) = &obj.body {
                exc = o.get_own("value")?;
            }
        }
        if self.type_of(exc) != TypeTag::String {
            return None;
        }
        let text = crate::object::string::rust_string_quiet(self, exc)?;
        ExcKind::from_message(&text)
    }

    /// Render the pending or given exception with its backtrace.
    pub fn format_exception(&self, exception: Value) -> Result<String, Raised> {
        crate::interp::format_exception(self, exception)
    }

    // === Locals ===

    /// Push an empty scoped local root. Released strictly LIFO.
    pub fn init_local(&self) -> Local<'_> {
        self.init_local_with(Value::BAD)
    }

    pub fn init_local_with(&self, value: Value) -> Local<'_> {
        Local::push(self, value)
    }

    /// Push `N` scoped locals at once, released together.
    pub fn init_locals<const N: usize>(&self) -> [Local<'_>; N] {
        std::array::from_fn(|_| self.init_local())
    }

    /// Register an unordered local root, released in any order.
    pub fn init_ulocal(&self, value: Value) -> ULocal<'_> {
        ULocal::insert(self, value)
    }

    // === Allocation ===

    /// Allocate a heap object. May trigger a collection; the body's
    /// references are kept visible to the collector throughout.
    pub fn alloc(&self, body: ObjBody) -> Result<Value, Raised> {
        let obj = HeapObject::new(body);
        self.alloc_object(obj)
    }

    /// Allocate with the read-only flag pre-set (strings and other
    /// immutable objects).
    pub fn alloc_read_only(&self, body: ObjBody) -> Result<Value, Raised> {
        let obj = HeapObject::new_read_only(body);
        self.alloc_object(obj)
    }

    fn alloc_object(&self, obj: HeapObject) -> Result<Value, Raised> {
        let heap = self.instance.heap();
        let size = obj.header.size();
        // The Arc fixes the body's address, which lets the slow path
        // publish it as a GC root for the whole allocation.
        let obj = Arc::new(obj);

        if size >= LARGE_OBJECT_THRESHOLD {
            return self.alloc_large(&obj);
        }

        // Fast path: below the GC threshold, with room on the current
        // page, no global locks and no GC.
        if !heap.crosses_threshold(size as usize) && !self.instance.gc.is_requested() {
            let cur = self.state.cur_page.lock().clone();
            if let Some(page) = cur {
                if let Some(handle) = heap.place(&page, &obj) {
                    return Ok(Value::from_handle(handle));
                }
            }
        }

        self.alloc_slow(&obj)
    }

    /// Slow path: safepoint, automatic collection, page acquisition.
    fn alloc_slow(&self, obj: &Arc<HeapObject>) -> Result<Value, Raised> {
        let heap = self.instance.heap();
        let size = obj.header.size();

        // Publish the body as a root for any collection that runs
        // while this allocation is in flight.
        self.publish_pending(obj);

        let result = (|| {
            // The allocation slow path is a safepoint.
            self.check_safepoint();

            let manual = self
                .instance
                .flags
                .contains(crate::config::InstanceFlags::MANUAL_GC);
            if !manual && heap.crosses_threshold(size as usize) {
                let mut stats = GcStats::default();
                gc::collect(self, &mut stats)?;
            }

            let mut collected = false;
            loop {
                let cur = self.state.cur_page.lock().clone();
                if let Some(page) = cur {
                    if let Some(handle) = heap.place(&page, obj) {
                        return Ok(handle);
                    }
                }
                match heap.acquire_page() {
                    Some(page) => {
                        *self.state.cur_page.lock() = Some(page);
                    }
                    None if !collected => {
                        collected = true;
                        let mut stats = GcStats::default();
                        gc::collect(self, &mut stats)?;
                    }
                    None => return Err(self.raise_oom()),
                }
            }
        })();

        self.clear_pending();
        result.map(Value::from_handle)
    }

    fn alloc_large(&self, obj: &Arc<HeapObject>) -> Result<Value, Raised> {
        let heap = self.instance.heap();

        self.publish_pending(obj);
        let result = (|| {
            self.check_safepoint();
            if let Some(handle) = heap.alloc_large(obj.clone()) {
                return Ok(handle);
            }
            let mut stats = GcStats::default();
            gc::collect(self, &mut stats)?;
            heap.alloc_large(obj.clone()).ok_or_else(|| self.raise_oom())
        })();
        self.clear_pending();

        result.map(Value::from_handle)
    }

    /// Point the pending-allocation root at an object's body. The
    /// pointer is only dereferenced by a collector while this thread
    /// is parked inside the allocation path, where the Arc keeps the
    /// body alive and pinned.
    fn publish_pending(&self, obj: &Arc<HeapObject>) {
        self.state
            .pending_body
            .store(&obj.body as *const ObjBody as *mut ObjBody, Ordering::Release);
    }

    fn clear_pending(&self) {
        self.state.pending_body.store(std::ptr::null_mut(), Ordering::Release);
    }

    /// Account growable-storage bytes against the side-allocation cap.
    pub fn adjust_malloc(&self, delta: isize) -> Result<(), Raised> {
        if self.instance.heap().adjust_malloc(delta) {
            Ok(())
        } else {
            Err(self.raise_oom())
        }
    }

    // === GC entry points ===

    /// Observe a pending GC request and park until the cycle ends.
    pub fn check_safepoint(&self) {
        crate::runtime::safepoint::check(self);
    }

    /// Collect garbage now, filling `stats`.
    pub fn collect_garbage(&self, stats: &mut GcStats) -> Result<(), Raised> {
        gc::collect(self, stats)
    }

    /// Join an in-progress collection as a mark helper.
    pub fn help_gc(&self) {
        gc::help(self);
    }

    /// Enter the suspended state around blocking native work.
    pub fn suspend(&self) {
        crate::runtime::safepoint::suspend(self);
    }

    /// Leave the suspended state; blocks while a collection needs
    /// quiescence.
    pub fn resume(&self) {
        crate::runtime::safepoint::resume(self);
    }
}

impl Drop for Context {
    fn drop(&mut self) {
        debug_assert!(
            self.state.locals.lock().is_empty(),
            "locals must be released before the thread unregisters"
        );
        let mut contexts = self.instance.threads.contexts.lock();
        contexts.retain(|state| !Arc::ptr_eq(state, &self.state));
    }
}
