//! Module cache and function table.
//!
//! Modules are kept in an id-keyed table; a function holds a non-owning
//! reference (the module id) to the module that defines it. Teardown is
//! deferred: `reload` marks the old slot PendingUnload and the slot closes
//! when the last in-flight call leaves.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use rmpv::Value;

use kestrel_common::error::FuncError;

/// Opaque token minted by the backend for one loaded library.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleHandle(pub u64);

/// Registry-assigned module id; stable across the module's lifetime,
/// never reused.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ModuleId(pub u64);

/// An invocable function pointer resolved from a module (or a builtin).
pub type FuncPtr = Arc<dyn Fn(&[Value]) -> Result<Vec<Value>, String> + Send + Sync>;

/// The dynamic-loading collaborator. Real dlopen lives behind this trait;
/// tests substitute a stub.
pub trait ModuleBackend: Send + Sync {
    fn load(&self, path: &str) -> Result<ModuleHandle, FuncError>;
    fn resolve(&self, handle: ModuleHandle, symbol: &str) -> Result<FuncPtr, FuncError>;
    fn unload(&self, handle: ModuleHandle);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleState {
    Loaded,
    /// Superseded by a reload; closes when the last in-flight call leaves.
    PendingUnload,
    Closed,
}

struct ModuleSlot {
    path: String,
    handle: ModuleHandle,
    state: ModuleState,
    inflight: u64,
}

/// Id-keyed module table.
pub struct ModuleRegistry {
    backend: Arc<dyn ModuleBackend>,
    slots: DashMap<u64, ModuleSlot>,
    /// Path → id of the currently Loaded module for that path.
    by_path: DashMap<String, u64>,
    seq: AtomicU64,
}

impl ModuleRegistry {
    pub fn new(backend: Arc<dyn ModuleBackend>) -> ModuleRegistry {
        ModuleRegistry {
            backend,
            slots: DashMap::new(),
            by_path: DashMap::new(),
            seq: AtomicU64::new(1),
        }
    }

    /// Load a library (or return the already-loaded module for the path).
    pub fn load(&self, path: &str) -> Result<ModuleId, FuncError> {
        if let Some(id) = self.by_path.get(path) {
            return Ok(ModuleId(*id));
        }
        let handle = self.backend.load(path)?;
        let id = self.seq.fetch_add(1, Ordering::Relaxed);
        self.slots.insert(
            id,
            ModuleSlot {
                path: path.to_string(),
                handle,
                state: ModuleState::Loaded,
                inflight: 0,
            },
        );
        self.by_path.insert(path.to_string(), id);
        tracing::debug!(path, module = id, "module loaded");
        Ok(ModuleId(id))
    }

    pub fn resolve(&self, module: ModuleId, symbol: &str) -> Result<FuncPtr, FuncError> {
        let slot = self
            .slots
            .get(&module.0)
            .ok_or(FuncError::ModuleClosed)?;
        if slot.state == ModuleState::Closed {
            return Err(FuncError::ModuleClosed);
        }
        self.backend.resolve(slot.handle, symbol)
    }

    pub fn state(&self, module: ModuleId) -> Option<ModuleState> {
        self.slots.get(&module.0).map(|s| s.state)
    }

    pub fn path(&self, module: ModuleId) -> Option<String> {
        self.slots.get(&module.0).map(|s| s.path.clone())
    }

    /// Enter a call against a module. Fails when the module is already
    /// closed; PendingUnload modules still accept the calls that raced
    /// with the reload.
    pub fn enter_call(&self, module: ModuleId) -> Result<CallGuard<'_>, FuncError> {
        let mut slot = self
            .slots
            .get_mut(&module.0)
            .ok_or(FuncError::ModuleClosed)?;
        if slot.state == ModuleState::Closed {
            return Err(FuncError::ModuleClosed);
        }
        slot.inflight += 1;
        Ok(CallGuard {
            registry: self,
            module,
        })
    }

    fn leave_call(&self, module: ModuleId) {
        let unload = {
            let mut slot = match self.slots.get_mut(&module.0) {
                Some(slot) => slot,
                None => return,
            };
            slot.inflight -= 1;
            if slot.state == ModuleState::PendingUnload && slot.inflight == 0 {
                slot.state = ModuleState::Closed;
                Some(slot.handle)
            } else {
                None
            }
        };
        if let Some(handle) = unload {
            self.backend.unload(handle);
            tracing::debug!(module = module.0, "deferred module unload completed");
        }
    }

    /// Supersede a module: mark it PendingUnload, closing immediately if
    /// nothing is in flight. The path mapping is handed to `new_id`.
    fn supersede(&self, old: ModuleId, new_id: ModuleId, path: &str) {
        self.by_path.insert(path.to_string(), new_id.0);
        let unload = {
            let mut slot = match self.slots.get_mut(&old.0) {
                Some(slot) => slot,
                None => return,
            };
            slot.state = ModuleState::PendingUnload;
            if slot.inflight == 0 {
                slot.state = ModuleState::Closed;
                Some(slot.handle)
            } else {
                None
            }
        };
        if let Some(handle) = unload {
            self.backend.unload(handle);
        }
    }
}

/// RAII guard for one in-flight call.
pub struct CallGuard<'a> {
    registry: &'a ModuleRegistry,
    module: ModuleId,
}

impl Drop for CallGuard<'_> {
    fn drop(&mut self) {
        self.registry.leave_call(self.module);
    }
}

struct Func {
    /// `None` for builtins, which never reload.
    module: Option<ModuleId>,
    symbol: String,
    ptr: FuncPtr,
}

/// Name-keyed function table over the module registry.
pub struct FuncRegistry {
    modules: Arc<ModuleRegistry>,
    funcs: DashMap<String, Func>,
}

impl FuncRegistry {
    pub fn new(modules: Arc<ModuleRegistry>) -> FuncRegistry {
        FuncRegistry {
            modules,
            funcs: DashMap::new(),
        }
    }

    pub fn modules(&self) -> &Arc<ModuleRegistry> {
        &self.modules
    }

    /// Register a function implemented in-process.
    pub fn register_builtin(&self, name: &str, ptr: FuncPtr) {
        self.funcs.insert(
            name.to_string(),
            Func {
                module: None,
                symbol: name.to_string(),
                ptr,
            },
        );
    }

    /// Define a function backed by a module symbol, loading the module on
    /// first use.
    pub fn create(&self, name: &str, path: &str, symbol: &str) -> Result<(), FuncError> {
        let module = self.modules.load(path)?;
        let ptr = self.modules.resolve(module, symbol)?;
        self.funcs.insert(
            name.to_string(),
            Func {
                module: Some(module),
                symbol: symbol.to_string(),
                ptr,
            },
        );
        Ok(())
    }

    pub fn drop_function(&self, name: &str) -> Result<(), FuncError> {
        self.funcs
            .remove(name)
            .map(|_| ())
            .ok_or_else(|| FuncError::NoSuchFunction(name.to_string()))
    }

    /// Invoke a function by name. Module-backed calls hold a guard so the
    /// module cannot be torn down underneath them.
    pub fn call(&self, name: &str, args: &[Value]) -> Result<Vec<Value>, FuncError> {
        let (module, ptr) = {
            let func = self
                .funcs
                .get(name)
                .ok_or_else(|| FuncError::NoSuchFunction(name.to_string()))?;
            (func.module, Arc::clone(&func.ptr))
        };
        let _guard = match module {
            Some(module) => Some(self.modules.enter_call(module)?),
            None => None,
        };
        ptr(args).map_err(|reason| FuncError::Call {
            name: name.to_string(),
            reason,
        })
    }

    /// Reload a module in place: load the new library, re-resolve every
    /// surviving function, then retire the old module. A missing symbol
    /// aborts the reload with the old module fully intact.
    pub fn reload(&self, path: &str) -> Result<(), FuncError> {
        let old_id = self
            .by_path_id(path)
            .ok_or_else(|| FuncError::NoSuchModule(path.to_string()))?;
        let new_handle = self.modules.backend.load(path)?;

        let mut repointed: Vec<(String, FuncPtr)> = Vec::new();
        for entry in self.funcs.iter() {
            if entry.module != Some(old_id) {
                continue;
            }
            match self.modules.backend.resolve(new_handle, &entry.symbol) {
                Ok(ptr) => repointed.push((entry.key().clone(), ptr)),
                Err(e) => {
                    self.modules.backend.unload(new_handle);
                    return Err(e);
                }
            }
        }

        let new_id = ModuleId(self.modules.seq.fetch_add(1, Ordering::Relaxed));
        self.modules.slots.insert(
            new_id.0,
            ModuleSlot {
                path: path.to_string(),
                handle: new_handle,
                state: ModuleState::Loaded,
                inflight: 0,
            },
        );
        for (name, ptr) in repointed {
            if let Some(mut func) = self.funcs.get_mut(&name) {
                func.module = Some(new_id);
                func.ptr = ptr;
            }
        }
        self.modules.supersede(old_id, new_id, path);
        tracing::info!(path, old = old_id.0, new = new_id.0, "module reloaded");
        Ok(())
    }

    fn by_path_id(&self, path: &str) -> Option<ModuleId> {
        self.modules.by_path.get(path).map(|id| ModuleId(*id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::atomic::AtomicUsize;

    /// Stub backend: every "module" is a generation counter; resolving a
    /// symbol returns a closure reporting that generation.
    struct StubBackend {
        loads: AtomicU64,
        unloads: AtomicUsize,
        missing_symbol: parking_lot::Mutex<Option<String>>,
    }

    impl StubBackend {
        fn new() -> Arc<StubBackend> {
            Arc::new(StubBackend {
                loads: AtomicU64::new(0),
                unloads: AtomicUsize::new(0),
                missing_symbol: parking_lot::Mutex::new(None),
            })
        }
    }

    impl ModuleBackend for StubBackend {
        fn load(&self, _path: &str) -> Result<ModuleHandle, FuncError> {
            Ok(ModuleHandle(self.loads.fetch_add(1, Ordering::Relaxed) + 1))
        }

        fn resolve(&self, handle: ModuleHandle, symbol: &str) -> Result<FuncPtr, FuncError> {
            if self.missing_symbol.lock().as_deref() == Some(symbol) {
                return Err(FuncError::NoSuchSymbol(symbol.to_string()));
            }
            let generation = handle.0;
            Ok(Arc::new(move |_args: &[Value]| {
                Ok(vec![Value::from(generation)])
            }))
        }

        fn unload(&self, _handle: ModuleHandle) {
            self.unloads.fetch_add(1, Ordering::Relaxed);
        }
    }

    fn registry(backend: &Arc<StubBackend>) -> FuncRegistry {
        FuncRegistry::new(Arc::new(ModuleRegistry::new(
            Arc::clone(backend) as Arc<dyn ModuleBackend>
        )))
    }

    #[test]
    fn builtin_call() {
        let backend = StubBackend::new();
        let funcs = registry(&backend);
        funcs.register_builtin(
            "echo",
            Arc::new(|args: &[Value]| Ok(args.to_vec())),
        );
        let out = funcs.call("echo", &[Value::from(7u64)]).unwrap();
        assert_eq!(out, vec![Value::from(7u64)]);
        assert!(matches!(
            funcs.call("nope", &[]),
            Err(FuncError::NoSuchFunction(_))
        ));
    }

    #[test]
    fn function_failure_is_typed() {
        let backend = StubBackend::new();
        let funcs = registry(&backend);
        funcs.register_builtin("boom", Arc::new(|_| Err("went wrong".into())));
        let err = funcs.call("boom", &[]).unwrap_err();
        assert!(matches!(err, FuncError::Call { .. }));
    }

    #[test]
    fn reload_repoints_functions() {
        let backend = StubBackend::new();
        let funcs = registry(&backend);
        funcs.create("f", "mod.so", "f_impl").unwrap();
        assert_eq!(funcs.call("f", &[]).unwrap(), vec![Value::from(1u64)]);

        funcs.reload("mod.so").unwrap();
        // Calls now hit the second generation; the old module is closed.
        assert_eq!(funcs.call("f", &[]).unwrap(), vec![Value::from(2u64)]);
        assert_eq!(backend.unloads.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn reload_with_missing_symbol_keeps_old_module() {
        let backend = StubBackend::new();
        let funcs = registry(&backend);
        funcs.create("f", "mod.so", "f_impl").unwrap();
        *backend.missing_symbol.lock() = Some("f_impl".to_string());

        assert!(matches!(
            funcs.reload("mod.so"),
            Err(FuncError::NoSuchSymbol(_))
        ));
        // The failed candidate was unloaded; the original still serves.
        assert_eq!(backend.unloads.load(Ordering::Relaxed), 1);
        *backend.missing_symbol.lock() = None;
        assert_eq!(funcs.call("f", &[]).unwrap(), vec![Value::from(1u64)]);
    }

    #[test]
    fn unload_deferred_past_in_flight_call() {
        let backend = StubBackend::new();
        let funcs = registry(&backend);
        funcs.create("f", "mod.so", "f_impl").unwrap();
        let old_id = funcs.by_path_id("mod.so").unwrap();

        let guard = funcs.modules.enter_call(old_id).unwrap();
        funcs.reload("mod.so").unwrap();
        assert_eq!(funcs.modules.state(old_id), Some(ModuleState::PendingUnload));
        assert_eq!(backend.unloads.load(Ordering::Relaxed), 0);

        drop(guard);
        assert_eq!(funcs.modules.state(old_id), Some(ModuleState::Closed));
        assert_eq!(backend.unloads.load(Ordering::Relaxed), 1);

        // New calls against the closed module are refused.
        assert!(matches!(
            funcs.modules.enter_call(old_id),
            Err(FuncError::ModuleClosed)
        ));
    }

    #[test]
    fn load_is_idempotent_per_path() {
        let backend = StubBackend::new();
        let funcs = registry(&backend);
        funcs.create("a", "mod.so", "a_impl").unwrap();
        funcs.create("b", "mod.so", "b_impl").unwrap();
        assert_eq!(backend.loads.load(Ordering::Relaxed), 1);
    }

    #[test]
    fn drop_function_removes_name() {
        let backend = StubBackend::new();
        let funcs = registry(&backend);
        funcs.register_builtin("f", Arc::new(|_| Ok(vec![])));
        funcs.drop_function("f").unwrap();
        assert!(matches!(
            funcs.call("f", &[]),
            Err(FuncError::NoSuchFunction(_))
        ));
        assert!(funcs.drop_function("f").is_err());
    }
}
