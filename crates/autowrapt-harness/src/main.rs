//! End-to-end harness host: a minimal embedder with the shape of a real
//! startup sequence — preload constructor, site main, argv, program
//! import — plus stand-in instrumentation packages selected through
//! harness env vars. The scenario tests spawn this binary and assert on
//! exact stdout/stderr/exit code.

use autowrapt_host::{Module, RuntimeHost};
// Pre-main constructor; installs the shim before main runs.
use autowrapt_preload as _;

/// Which supermeter stand-in to register: `good`, `bad` (loader fails),
/// `panic` (activation panics), anything else = not installed.
const PACKAGE_VAR: &str = "AUTOWRAPT_HARNESS_PACKAGE";
/// Set to `0` to disable the user customize layer (virtualenv analog).
const USER_SITE_VAR: &str = "AUTOWRAPT_HARNESS_USER_SITE";
/// `early` publishes argv before site main (customize-path bootstrap),
/// anything else publishes it after (import-hook fallback path).
const ARGV_VAR: &str = "AUTOWRAPT_HARNESS_ARGV";

fn main() {
    let host = RuntimeHost::global();

    host.register_provider("hello", |_| {
        Ok(Module::new("hello").with_entry("main", || {
            println!("hello world.");
            Ok(())
        }))
    });

    match std::env::var(PACKAGE_VAR).as_deref() {
        Ok("good") => host.register_provider("supertenant.supermeter", |_| {
            Ok(Module::new("supertenant.supermeter").with_entry("_load", || {
                println!("supermeter loaded successfully.");
                Ok(())
            }))
        }),
        Ok("bad") => host.register_provider("supertenant.supermeter", |_| {
            Err("supermeter package is broken".into())
        }),
        Ok("panic") => host.register_provider("supertenant.supermeter", |_| {
            Ok(Module::new("supertenant.supermeter")
                .with_entry("_load", || panic!("activation blew up")))
        }),
        _ => {}
    }

    if std::env::var(USER_SITE_VAR).as_deref() == Ok("0") {
        host.set_user_customize_enabled(false);
    }

    let argv: Vec<String> = std::env::args().collect();
    let argv_early = std::env::var(ARGV_VAR).as_deref() == Ok("early");
    if argv_early {
        host.set_argv(argv.clone());
    }
    host.run_site_main();
    if !argv_early {
        host.set_argv(argv);
    }

    let hello = match host.import("hello") {
        Ok(module) => module,
        Err(err) => {
            eprintln!("harness: failed to import hello: {err}");
            std::process::exit(1);
        }
    };
    let entry = hello.entry("main").expect("hello module missing 'main'");
    if let Err(err) = entry() {
        eprintln!("harness: hello failed: {err}");
        std::process::exit(1);
    }
}
