use std::{fmt, sync::Arc};

use once_cell::sync::OnceCell;
use parking_lot::RwLock;

use crate::{
    config::Config,
    decode::{Decoded, ReferenceDecoder},
    error::{fatal, Error, Result},
    guard::ThreadStateGuard,
    irt::{IndirectReferenceTable, FIRST_SEGMENT},
    policy::ForceCopyPolicy,
    reference::{Handle, ObjectRef, RefKind, ReferenceTable, Resolved},
    registry::ThreadRegistry,
    safepoint::StopTheWorld,
    state::ThreadState,
    thread::ThreadEntry,
};

static RUNTIME: OnceCell<Runtime> = OnceCell::new();

/// The boundary-crossing side of a managed runtime: attached threads, their
/// state guards and the global reference tables.
pub struct Runtime {
    config: Config,
    policy: ForceCopyPolicy,
    registry: ThreadRegistry,
    globals: RwLock<IndirectReferenceTable>,
    weak_globals: RwLock<IndirectReferenceTable>,
}

impl Runtime {
    pub fn new(config: Config) -> Self {
        log::debug!(target: "jni", "creating runtime with {:?}", config);
        Self {
            policy: ForceCopyPolicy::from_config(&config),
            registry: ThreadRegistry::new(&config),
            globals: RwLock::new(IndirectReferenceTable::new(
                RefKind::Global,
                config.global_capacity,
                false,
            )),
            weak_globals: RwLock::new(IndirectReferenceTable::new(
                RefKind::WeakGlobal,
                config.weak_global_capacity,
                false,
            )),
            config,
        }
    }

    /// Initializes the process-wide runtime. Later calls return the existing
    /// one and ignore `config`.
    pub fn init(config: Config) -> &'static Runtime {
        RUNTIME.get_or_init(|| Runtime::new(config))
    }

    pub fn global() -> Option<&'static Runtime> {
        RUNTIME.get()
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn registry(&self) -> &ThreadRegistry {
        &self.registry
    }

    pub fn force_copy_policy(&self) -> ForceCopyPolicy {
        self.policy
    }

    pub fn attach_current_thread(&self, name: Option<&str>) -> Result<Arc<ThreadEntry>> {
        self.registry.attach_current(name)
    }

    pub fn detach_current_thread(&self) -> Result<()> {
        self.registry.detach_current()
    }

    pub fn current_thread(&self) -> Option<Arc<ThreadEntry>> {
        self.registry.current()
    }

    /// Moves the calling thread to `target` until the returned guard is
    /// dropped. Entering Runnable passes a checkpoint and may block while a
    /// pause is in progress.
    ///
    /// This is the outermost entry only. A thread that already holds a guard
    /// nests through [`ThreadStateGuard::nested`].
    pub fn enter_boundary(&self, target: ThreadState) -> Result<ThreadStateGuard<'_>> {
        let thread = self.registry.current().ok_or(Error::NotAttached)?;
        let guards = thread.guard_depth();
        if guards > 0 {
            return Err(Error::InvalidState {
                thread: thread.name().to_string(),
                state: thread.state(),
                guards,
            });
        }

        ThreadStateGuard::enter(self, thread, target)
    }

    /// Closure form of [`Runtime::enter_boundary`].
    pub fn with_state<R>(
        &self,
        target: ThreadState,
        f: impl FnOnce(&mut ThreadStateGuard<'_>) -> R,
    ) -> Result<R> {
        let mut guard = self.enter_boundary(target)?;
        Ok(f(&mut guard))
    }

    /// Reference tables as seen by the guard's thread.
    pub fn references<'a>(&'a self, guard: &'a ThreadStateGuard<'_>) -> ThreadReferences<'a> {
        ThreadReferences {
            locals: guard.thread().locals(),
            globals: &self.globals,
            weak_globals: &self.weak_globals,
        }
    }

    pub fn decode<'g>(
        &self,
        guard: &'g ThreadStateGuard<'_>,
        handle: Handle,
    ) -> Result<Decoded<'g>> {
        let references = self.references(guard);
        ReferenceDecoder::new(&references)
            .with_check_jni(self.config.check_jni)
            .decode(guard, handle)
    }

    pub fn decode_raw<'g>(
        &self,
        guard: &'g ThreadStateGuard<'_>,
        raw: usize,
    ) -> Result<Decoded<'g>> {
        let references = self.references(guard);
        ReferenceDecoder::new(&references)
            .with_check_jni(self.config.check_jni)
            .decode_raw(guard, raw)
    }

    pub fn new_global_ref(&self, guard: &ThreadStateGuard<'_>, obj: ObjectRef) -> Result<Handle> {
        guard.ensure_runnable()?;
        self.globals.write().add(FIRST_SEGMENT, obj)
    }

    pub fn new_weak_global_ref(
        &self,
        guard: &ThreadStateGuard<'_>,
        obj: ObjectRef,
    ) -> Result<Handle> {
        guard.ensure_runnable()?;
        self.weak_globals.write().add(FIRST_SEGMENT, obj)
    }

    pub fn delete_global_ref(&self, handle: Handle) -> bool {
        self.globals.write().remove(FIRST_SEGMENT, handle)
    }

    pub fn delete_weak_global_ref(&self, handle: Handle) -> bool {
        self.weak_globals.write().remove(FIRST_SEGMENT, handle)
    }

    pub fn global_ref_count(&self) -> usize {
        self.globals.read().len()
    }

    pub fn weak_global_ref_count(&self) -> usize {
        self.weak_globals.read().len()
    }

    pub fn suspend_all(&self, cause: &str) -> Result<StopTheWorld<'_>> {
        self.registry.suspend_all(cause)
    }

    /// Processes weak globals after marking. `update` returns the new location
    /// of a live target and `None` for a dead one. Returns how many were
    /// cleared.
    pub fn sweep_weak_globals(
        &self,
        world: &StopTheWorld<'_>,
        update: impl FnMut(ObjectRef) -> Option<ObjectRef>,
    ) -> usize {
        self.check_world(world);
        let cleared = self.weak_globals.write().sweep(update);
        log::debug!(target: "jni", "swept weak globals during \"{}\": {} cleared", world.cause(), cleared);
        cleared
    }

    pub fn clear_weak_global(&self, world: &StopTheWorld<'_>, handle: Handle) -> Result<()> {
        self.check_world(world);
        self.weak_globals.write().clear_weak(handle)
    }

    /// Visits globals and every attached thread's locals as roots. The value
    /// returned by `visit` replaces the reference, for moving collectors.
    pub fn visit_roots(
        &self,
        world: &StopTheWorld<'_>,
        mut visit: impl FnMut(RefKind, ObjectRef) -> ObjectRef,
    ) {
        self.check_world(world);
        self.globals
            .write()
            .visit_roots(|obj| visit(RefKind::Global, obj));
        for thread in self.registry.threads() {
            thread
                .locals()
                .write()
                .visit_roots(|obj| visit(RefKind::Local, obj));
        }
    }

    fn check_world(&self, world: &StopTheWorld<'_>) {
        if !std::ptr::eq(world.registry(), &self.registry) {
            fatal(format_args!(
                "\"{}\" stopped the world of another runtime",
                world.cause()
            ));
        }
    }
}

impl fmt::Display for Runtime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "{} attached thread(s)", self.registry.len())?;
        writeln!(f, "{}", self.globals.read())?;
        write!(f, "{}", self.weak_globals.read())
    }
}

/// The tables a handle may live in, from one thread's point of view.
pub struct ThreadReferences<'a> {
    locals: &'a RwLock<IndirectReferenceTable>,
    globals: &'a RwLock<IndirectReferenceTable>,
    weak_globals: &'a RwLock<IndirectReferenceTable>,
}

impl ReferenceTable for ThreadReferences<'_> {
    fn resolve(&self, handle: Handle) -> Result<Resolved> {
        match handle.kind() {
            RefKind::Local => self.locals.resolve(handle),
            RefKind::Global => self.globals.resolve(handle),
            RefKind::WeakGlobal => self.weak_globals.resolve(handle),
        }
    }
}
