//! Auto-bootstrap shim for the supermeter instrumentation package.
//!
//! Linked into a host runtime (normally through `autowrapt-preload`'s
//! pre-main constructor), this crate patches the host's startup customize
//! slots so that, as soon as startup reaches the point where argv is
//! known, it decides — based on environment configuration — whether to
//! import `supertenant.supermeter` and invoke its activation entry. The
//! hosted program never has to import anything itself.
//!
//! Activation is a one-shot latch: it happens at most once per process no
//! matter how many hook paths fire, and a missing or broken
//! instrumentation package is reported on stderr without ever taking the
//! host program down.
//!
//! Three trigger paths cooperate, because a process can reach readiness
//! in different ways:
//!
//! - both customize slots get wrapped so the bootstrap decision runs when
//!   the later one finishes (or the earlier one, when the user layer is
//!   disabled);
//! - if both layers already ran before the installer (late attach), the
//!   decision runs immediately;
//! - if the slots fire before argv exists, a temporary hook on the import
//!   primitive waits for readiness, bootstraps, and removes itself.

mod config;

use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};

use autowrapt_host::{ImportError, ImportFn, Module, RuntimeHost};
use parking_lot::Mutex;

pub use config::{BOOTSTRAP_FLAG_VAR, BOOTSTRAP_LIST_VAR, DEBUG_VAR, bootstrap_enabled, truthy};

/// Dotted path of the instrumentation module, resolved at activation
/// time through the host's current import primitive.
pub const SUPERMETER_MODULE: &str = "supertenant.supermeter";
/// Zero-argument activation entry looked up on the module.
pub const SUPERMETER_ENTRY: &str = "_load";

const FATAL_LINE: &str =
    "[supertenant-supermeter] FATAL: failed to auto-load, instrumentation will not be available.";
const DEBUG_TAG: &str = "[supertenant-supermeter-autowrapt] DEBUG:";

fn debug_enabled() -> bool {
    static DEBUG: OnceLock<bool> = OnceLock::new();
    *DEBUG.get_or_init(|| {
        std::env::var(config::DEBUG_VAR)
            .map(|value| config::truthy(&value))
            .unwrap_or(false)
    })
}

fn debug(msg: &str) {
    if debug_enabled() {
        eprintln!("{DEBUG_TAG} {msg}");
    }
}

/// True once the host runtime has populated argv.
///
/// Plenty of instrumentation code assumes argv exists, so this is the
/// gate for running any of it. Safe to call arbitrarily early and
/// arbitrarily often; no side effects.
pub fn can_bootstrap(host: &RuntimeHost) -> bool {
    host.argv_is_set()
}

/// Install the shim on the process-wide host.
///
/// This is the top-level entry the installed artifact calls
/// (`autowrapt-preload`'s constructor); everything else follows from the
/// hooks it plants. Idempotent.
pub fn bootstrap() {
    Bootstrap::global().install(RuntimeHost::global());
}

// ── Shim state ───────────────────────────────────────────────────

/// The process-wide one-shot latch, reachable from every trigger path.
///
/// A single instance exists per process in production
/// ([`Bootstrap::global`]); tests build fresh instances against fresh
/// hosts instead of resetting shared state.
pub struct Bootstrap {
    /// Set the first time the decision routine runs to completion;
    /// never reset, even when the load fails.
    bootstrapped: AtomicBool,
    /// Set once the installer has patched the customize slots (or done
    /// the late-attach immediate bootstrap).
    patched: AtomicBool,
    /// The import primitive displaced by the fallback hook; set once,
    /// never cleared, always the delegation target.
    original_import: Mutex<Option<ImportFn>>,
    /// The hook we installed, kept so the hook can tell whether the slot
    /// still holds it.
    installed_hook: Mutex<Option<ImportFn>>,
    /// Set when a third party took over the import slot while our hook
    /// was live; from then on the hook only ever delegates.
    passthrough: AtomicBool,
}

impl Bootstrap {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            bootstrapped: AtomicBool::new(false),
            patched: AtomicBool::new(false),
            original_import: Mutex::new(None),
            installed_hook: Mutex::new(None),
            passthrough: AtomicBool::new(false),
        })
    }

    pub fn global() -> &'static Arc<Bootstrap> {
        static SHIM: OnceLock<Arc<Bootstrap>> = OnceLock::new();
        SHIM.get_or_init(Bootstrap::new)
    }

    pub fn bootstrapped(&self) -> bool {
        self.bootstrapped.load(Ordering::SeqCst)
    }

    pub fn patched(&self) -> bool {
        self.patched.load(Ordering::SeqCst)
    }

    pub fn passthrough(&self) -> bool {
        self.passthrough.load(Ordering::SeqCst)
    }

    // ── Lifecycle hook installer ─────────────────────────────

    /// Patch the host's customize slots so the bootstrap decision runs
    /// as the last thing in startup. Subsequent calls are no-ops.
    pub fn install(self: &Arc<Self>, host: &Arc<RuntimeHost>) {
        if self.patched.swap(true, Ordering::SeqCst) {
            return;
        }
        debug("installing startup hooks");

        // If either customize module is already in the cache, both
        // layers are behind us and the slots will never fire again, so
        // the decision has to run right now.
        if host.module_loaded("sitecustomize") || host.module_loaded("usercustomize") {
            debug("customize layers already ran, bootstrapping now");
            self.maybe_bootstrap(host);
            return;
        }

        // Wrap both slots. The wrapped slot may fail however it likes;
        // the drop guard makes the bootstrap check run regardless. The
        // site-layer wrapper only acts when the user layer is disabled,
        // because otherwise the user-layer wrapper runs later and does
        // the work at the latest possible point.
        let site_inner = host.site_customize_slot();
        let shim = Arc::clone(self);
        let shim_host = Arc::clone(host);
        host.set_site_customize_slot(Arc::new(move |rt: &RuntimeHost| {
            let _after = AfterCustomize {
                shim: Arc::clone(&shim),
                host: Arc::clone(&shim_host),
                only_if_user_layer_disabled: true,
            };
            site_inner(rt);
        }));

        let user_inner = host.user_customize_slot();
        let shim = Arc::clone(self);
        let shim_host = Arc::clone(host);
        host.set_user_customize_slot(Arc::new(move |rt: &RuntimeHost| {
            let _after = AfterCustomize {
                shim: Arc::clone(&shim),
                host: Arc::clone(&shim_host),
                only_if_user_layer_disabled: false,
            };
            user_inner(rt);
        }));
    }

    // ── Maybe-bootstrap entry point ──────────────────────────

    /// Bootstrap now if the host is ready; otherwise arm the import
    /// hook and let the next post-readiness import do it.
    pub fn maybe_bootstrap(self: &Arc<Self>, host: &Arc<RuntimeHost>) {
        if can_bootstrap(host) {
            self.bootstrap_supermeter(host);
            return;
        }
        // Still too early. Past the customize slots there is no later
        // startup hook left, but the host imports the program it is
        // about to run, so the import primitive is guaranteed to fire
        // again before any user code.
        self.install_import_hook(host);
    }

    // ── Import interception fallback ─────────────────────────

    fn install_import_hook(self: &Arc<Self>, host: &Arc<RuntimeHost>) {
        let mut original = self.original_import.lock();
        if original.is_some() {
            return;
        }
        *original = Some(host.import_slot());
        drop(original);

        let shim = Arc::clone(self);
        let hook: ImportFn = Arc::new(move |rt: &RuntimeHost, name: &str| shim.import_hook(rt, name));
        *self.installed_hook.lock() = Some(Arc::clone(&hook));
        host.set_import_slot(hook);
        debug("import hook installed");
    }

    fn import_hook(&self, host: &RuntimeHost, name: &str) -> Result<Module, ImportError> {
        if debug_enabled() {
            debug(&format!("import hook: {name}"));
        }
        if !self.passthrough() && can_bootstrap(host) {
            let ours = self.installed_hook.lock().clone();
            let current = host.import_slot();
            match ours {
                Some(ours) if Arc::ptr_eq(&ours, &current) => {
                    debug("import hook: removing hook");
                    if let Some(original) = self.original_import.lock().clone() {
                        host.set_import_slot(original);
                    }
                }
                _ => {
                    // Someone replaced the import primitive after us; we
                    // can no longer restore it safely, so stay installed
                    // and stop doing anything beyond delegation.
                    debug("import hook: setting passthrough mode");
                    self.passthrough.store(true, Ordering::SeqCst);
                }
            }
            self.bootstrap_supermeter(host);
        }
        // The original is captured before the hook can be installed; if
        // the slot is ever empty anyway, the default primitive stands in
        // rather than failing the import.
        match self.original_import.lock().clone() {
            Some(original) => original(host, name),
            None => autowrapt_host::default_import(host, name),
        }
    }

    // ── Bootstrap decision routine ───────────────────────────

    /// Decide once whether to load supermeter, and do it.
    ///
    /// Every trigger path funnels here. The latch commits before the
    /// configuration is even read, so re-entrant or repeated triggers
    /// are no-ops whatever happens below. A failed load is reported on
    /// stderr and otherwise swallowed: the host program must run
    /// exactly as it would have without us.
    pub fn bootstrap_supermeter(&self, host: &RuntimeHost) {
        if self.bootstrapped.swap(true, Ordering::SeqCst) {
            return;
        }
        debug("bootstrap decision");

        if !config::bootstrap_enabled() {
            debug("bootstrap disabled by configuration");
            return;
        }

        debug("importing and activating supermeter");
        let outcome = panic::catch_unwind(AssertUnwindSafe(|| load_supermeter(host)));
        let failure = match outcome {
            Ok(Ok(())) => None,
            Ok(Err(trace)) => Some(trace),
            Err(payload) => Some(format!("panic: {}", panic_message(payload.as_ref()))),
        };
        if let Some(trace) = failure {
            eprintln!("{FATAL_LINE}");
            eprintln!("{trace}");
        }
    }
}

/// Runs the bootstrap check when a wrapped customize slot finishes,
/// success or failure — drop order gives the `finally` semantics.
struct AfterCustomize {
    shim: Arc<Bootstrap>,
    host: Arc<RuntimeHost>,
    /// The site-layer wrapper sets this: it only acts when the user
    /// layer will never run. Checked at drop time, since the wrapped
    /// slot itself may flip the flag.
    only_if_user_layer_disabled: bool,
}

impl Drop for AfterCustomize {
    fn drop(&mut self) {
        if self.only_if_user_layer_disabled && self.host.user_customize_enabled() {
            return;
        }
        self.shim.maybe_bootstrap(&self.host);
    }
}

fn load_supermeter(host: &RuntimeHost) -> Result<(), String> {
    let module = host
        .import(SUPERMETER_MODULE)
        .map_err(|err| error_chain(&err))?;
    let entry = module.entry(SUPERMETER_ENTRY).ok_or_else(|| {
        error_chain(&ImportError::MissingEntry {
            module: SUPERMETER_MODULE.into(),
            entry: SUPERMETER_ENTRY.into(),
        })
    })?;
    entry().map_err(|err| error_chain(err.as_ref()))
}

fn error_chain(err: &dyn std::error::Error) -> String {
    let mut rendered = err.to_string();
    let mut source = err.source();
    while let Some(cause) = source {
        rendered.push_str("\ncaused by: ");
        rendered.push_str(&cause.to_string());
        source = cause.source();
    }
    rendered
}

fn panic_message(payload: &(dyn std::any::Any + Send)) -> &str {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s
    } else {
        "<non-string panic payload>"
    }
}
