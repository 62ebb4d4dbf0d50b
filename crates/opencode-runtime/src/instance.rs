use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use opencode_storage::{
    default_legacy_root, Migrator, MultiSqliteBackend, Storage, DATA_DIR,
};

use crate::project::Project;
use crate::{Error, Result};

/// A lazily-initialized per-instance resource.
///
/// The implementing type's `TypeId` is the factory identity: one slot per
/// type per instance, initialized on first access. `teardown` runs during
/// disposal, in reverse initialization order.
pub trait InstanceState: Send + Sync + Sized + 'static {
    fn init(instance: &Instance) -> Result<Self>;

    fn teardown(&self) -> Result<()> {
        Ok(())
    }
}

type Teardown = Box<dyn Fn() -> Result<()> + Send + Sync>;

#[derive(Default)]
struct StateRegistry {
    slots: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
    teardowns: Vec<(&'static str, Teardown)>,
}

/// Project-scoped execution scope.
///
/// Owns the directory, the derived project descriptor and a cache of lazy
/// state slots. Scopes never share state: each `provide` call constructs a
/// fresh instance, and nested calls shadow rather than merge.
pub struct Instance {
    directory: PathBuf,
    project: Project,
    states: Mutex<StateRegistry>,
    disposed: AtomicBool,
}

impl Instance {
    /// Run `f` inside a freshly constructed scope for `directory`.
    /// The scope is disposed when `f` returns, success or not.
    pub fn provide<R>(
        directory: impl Into<PathBuf>,
        f: impl FnOnce(&Instance) -> Result<R>,
    ) -> Result<R> {
        let instance = Instance::new(directory.into());
        let result = f(&instance);
        instance.dispose();
        result
    }

    fn new(directory: PathBuf) -> Self {
        let project = Project::discover(&directory);
        Self {
            directory,
            project,
            states: Mutex::new(StateRegistry::default()),
            disposed: AtomicBool::new(false),
        }
    }

    pub fn directory(&self) -> &Path {
        &self.directory
    }

    pub fn project(&self) -> &Project {
        &self.project
    }

    /// Fetch (initializing on first access) the state slot for `S`.
    ///
    /// The factory runs outside the registry lock so it may request other
    /// states; a failed factory leaves the slot empty and the next access
    /// retries. After disposal every lookup answers `ScopeDisposed`.
    pub fn state<S: InstanceState>(&self) -> Result<Arc<S>> {
        if self.disposed.load(Ordering::Acquire) {
            return Err(Error::ScopeDisposed);
        }

        let type_id = TypeId::of::<S>();
        {
            let states = self.states.lock().unwrap_or_else(|e| e.into_inner());
            if let Some(slot) = states.slots.get(&type_id) {
                let slot = slot.clone();
                return Ok(slot
                    .downcast::<S>()
                    .ok()
                    .expect("slot type is fixed by its TypeId key"));
            }
        }

        let value = Arc::new(S::init(self)?);

        let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
        if self.disposed.load(Ordering::Acquire) {
            return Err(Error::ScopeDisposed);
        }
        if let Some(existing) = states.slots.get(&type_id) {
            // A factory requesting its own dependents can race the fill;
            // first insertion wins.
            let existing = existing.clone();
            return Ok(existing
                .downcast::<S>()
                .ok()
                .expect("slot type is fixed by its TypeId key"));
        }

        states.slots.insert(type_id, value.clone());
        let teardown_target = value.clone();
        states.teardowns.push((
            std::any::type_name::<S>(),
            Box::new(move || teardown_target.teardown()),
        ));
        Ok(value)
    }

    /// Release every initialized state in reverse initialization order.
    /// Idempotent; teardown failures are logged, not propagated.
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::AcqRel) {
            return;
        }

        let registry = {
            let mut states = self.states.lock().unwrap_or_else(|e| e.into_inner());
            std::mem::take(&mut *states)
        };

        for (name, teardown) in registry.teardowns.into_iter().rev() {
            if let Err(err) = teardown() {
                tracing::warn!(state = name, error = %err, "state teardown failed");
            }
        }
    }

    pub fn is_disposed(&self) -> bool {
        self.disposed.load(Ordering::Acquire)
    }
}

/// Per-project storage, opened lazily through the instance state cache.
///
/// Initialization runs outstanding layout migrations before handing the
/// backend out, so every caller observes the current layout.
pub struct ProjectStore {
    storage: Storage,
}

impl ProjectStore {
    pub fn storage(&self) -> &Storage {
        &self.storage
    }
}

impl InstanceState for ProjectStore {
    fn init(instance: &Instance) -> Result<Self> {
        let data_root = instance.directory().join(DATA_DIR);
        let storage = Storage::new(MultiSqliteBackend::open(&data_root)?);

        let project = instance.project();
        Migrator::new(&storage, &data_root).run(
            &default_legacy_root(),
            &project.worktree,
            &project.id,
        )?;

        Ok(Self { storage })
    }
}

/// Shorthand for the instance's storage facade.
pub fn storage(instance: &Instance) -> Result<Storage> {
    Ok(instance.state::<ProjectStore>()?.storage().clone())
}
