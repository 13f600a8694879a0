//! The host runtime's hookable startup surface.
//!
//! This crate models the parts of the host script runtime that the
//! `autowrapt` shim patches: the replaceable import primitive, the two
//! startup customize slots (site-wide and per-user), the loaded-module
//! cache, and the argv gate that marks how far startup has progressed.
//!
//! Embedders drive it in the usual order: register module providers,
//! call [`RuntimeHost::run_site_main`] once during startup, publish argv
//! with [`RuntimeHost::set_argv`], then import and run the program. All
//! imports — the runtime's own and the program's — route through the
//! current import slot, which is what makes import interception work.

use std::collections::HashMap;
use std::error::Error;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use compact_str::CompactString;
use parking_lot::{Mutex, RwLock};
use thiserror::Error;

pub type BoxError = Box<dyn Error + Send + Sync>;

/// A zero-argument fallible entry point exported by a module.
pub type EntryFn = Arc<dyn Fn() -> Result<(), BoxError> + Send + Sync>;

/// The import primitive. The active one is held in the host's import
/// slot and may be replaced wholesale; replacements are expected to
/// delegate to whatever they displaced.
pub type ImportFn = Arc<dyn Fn(&RuntimeHost, &str) -> Result<Module, ImportError> + Send + Sync>;

/// A startup customize slot. The host invokes each at most once, during
/// `run_site_main`.
pub type CustomizeFn = Arc<dyn Fn(&RuntimeHost) + Send + Sync>;

/// A module loader registered under a module name — the module search
/// path analog.
pub type ProviderFn = Arc<dyn Fn(&RuntimeHost) -> Result<Module, BoxError> + Send + Sync>;

#[derive(Debug, Error)]
pub enum ImportError {
    #[error("no module named '{0}'")]
    NotFound(CompactString),
    #[error("loader for '{name}' failed")]
    LoaderFailed {
        name: CompactString,
        #[source]
        source: BoxError,
    },
    #[error("module '{module}' has no entry '{entry}'")]
    MissingEntry {
        module: CompactString,
        entry: CompactString,
    },
}

// ── Modules ──────────────────────────────────────────────────────

/// A loaded module: a name plus its exported entry points.
#[derive(Clone)]
pub struct Module {
    name: CompactString,
    entries: HashMap<CompactString, EntryFn>,
}

impl std::fmt::Debug for Module {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Module")
            .field("name", &self.name)
            .finish_non_exhaustive()
    }
}

impl Module {
    pub fn new(name: impl Into<CompactString>) -> Self {
        Self {
            name: name.into(),
            entries: HashMap::new(),
        }
    }

    pub fn with_entry(
        mut self,
        name: impl Into<CompactString>,
        entry: impl Fn() -> Result<(), BoxError> + Send + Sync + 'static,
    ) -> Self {
        self.entries.insert(name.into(), Arc::new(entry));
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn entry(&self, name: &str) -> Option<EntryFn> {
        self.entries.get(name).cloned()
    }
}

// ── The host ─────────────────────────────────────────────────────

pub struct RuntimeHost {
    argv: RwLock<Option<Vec<String>>>,
    modules: Mutex<HashMap<CompactString, Module>>,
    providers: Mutex<HashMap<CompactString, ProviderFn>>,
    import_slot: Mutex<ImportFn>,
    site_customize_slot: Mutex<CustomizeFn>,
    user_customize_slot: Mutex<CustomizeFn>,
    user_customize_enabled: AtomicBool,
}

impl RuntimeHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            argv: RwLock::new(None),
            modules: Mutex::new(HashMap::new()),
            providers: Mutex::new(HashMap::new()),
            import_slot: Mutex::new(Arc::new(default_import)),
            site_customize_slot: Mutex::new(Arc::new(|host: &RuntimeHost| {
                host.run_customize_module("sitecustomize");
            })),
            user_customize_slot: Mutex::new(Arc::new(|host: &RuntimeHost| {
                host.run_customize_module("usercustomize");
            })),
            user_customize_enabled: AtomicBool::new(true),
        })
    }

    /// The process-wide host instance. Embedders that link
    /// `autowrapt-preload` get their pre-main hook installed on this one.
    pub fn global() -> &'static Arc<RuntimeHost> {
        static HOST: OnceLock<Arc<RuntimeHost>> = OnceLock::new();
        HOST.get_or_init(RuntimeHost::new)
    }

    // ── argv gate ────────────────────────────────────────────

    /// Publish the program's command-line arguments. Startup code uses
    /// this as the marker that initialization has reached the point
    /// where running foreign code is safe.
    pub fn set_argv(&self, argv: Vec<String>) {
        *self.argv.write() = Some(argv);
    }

    pub fn argv(&self) -> Option<Vec<String>> {
        self.argv.read().clone()
    }

    pub fn argv_is_set(&self) -> bool {
        self.argv.read().is_some()
    }

    // ── module cache and providers ───────────────────────────

    pub fn register_provider(
        &self,
        name: impl Into<CompactString>,
        provider: impl Fn(&RuntimeHost) -> Result<Module, BoxError> + Send + Sync + 'static,
    ) {
        self.providers.lock().insert(name.into(), Arc::new(provider));
    }

    pub fn module_loaded(&self, name: &str) -> bool {
        self.modules.lock().contains_key(name)
    }

    pub fn loaded_module(&self, name: &str) -> Option<Module> {
        self.modules.lock().get(name).cloned()
    }

    // ── import slot ──────────────────────────────────────────

    /// Import through whatever primitive currently occupies the slot.
    pub fn import(&self, name: &str) -> Result<Module, ImportError> {
        let slot = self.import_slot();
        slot(self, name)
    }

    pub fn import_slot(&self) -> ImportFn {
        self.import_slot.lock().clone()
    }

    pub fn set_import_slot(&self, slot: ImportFn) {
        *self.import_slot.lock() = slot;
    }

    // ── customize slots ──────────────────────────────────────

    pub fn site_customize_slot(&self) -> CustomizeFn {
        self.site_customize_slot.lock().clone()
    }

    pub fn set_site_customize_slot(&self, slot: CustomizeFn) {
        *self.site_customize_slot.lock() = slot;
    }

    pub fn user_customize_slot(&self) -> CustomizeFn {
        self.user_customize_slot.lock().clone()
    }

    pub fn set_user_customize_slot(&self, slot: CustomizeFn) {
        *self.user_customize_slot.lock() = slot;
    }

    /// Whether the per-user customize layer runs at all. Restricted and
    /// virtual-environment configurations turn it off.
    pub fn user_customize_enabled(&self) -> bool {
        self.user_customize_enabled.load(Ordering::SeqCst)
    }

    pub fn set_user_customize_enabled(&self, enabled: bool) {
        self.user_customize_enabled.store(enabled, Ordering::SeqCst);
    }

    /// The startup driver: runs the site customize slot, then the user
    /// customize slot when that layer is enabled. Called once by the
    /// embedder during startup.
    pub fn run_site_main(&self) {
        let site = self.site_customize_slot();
        site(self);
        if self.user_customize_enabled() {
            let user = self.user_customize_slot();
            user(self);
        }
    }

    fn run_customize_module(&self, name: &str) {
        match self.import(name) {
            Ok(_) | Err(ImportError::NotFound(_)) => {}
            Err(err) => eprintln!("error running {name}: {err}"),
        }
    }
}

/// The default import primitive: answer from the module cache, else run
/// the registered provider and cache the result.
pub fn default_import(host: &RuntimeHost, name: &str) -> Result<Module, ImportError> {
    if let Some(module) = host.modules.lock().get(name) {
        return Ok(module.clone());
    }
    let provider = host.providers.lock().get(name).cloned();
    let Some(provider) = provider else {
        return Err(ImportError::NotFound(name.into()));
    };
    // Loaders may import other modules; run them with no host lock held.
    let module = provider(host).map_err(|source| ImportError::LoaderFailed {
        name: name.into(),
        source,
    })?;
    host.modules.lock().insert(name.into(), module.clone());
    Ok(module)
}
