//! The installed artifact: a pre-main constructor that plants the
//! autowrapt startup hooks before any user code runs.
//!
//! Linking this crate into a host binary is the whole installation
//! step — the constructor runs once, as early as safely possible, and
//! calls the shim's top-level entry:
//!
//! ```rust,no_run
//! use autowrapt_preload as _;
//! ```

use ctor::ctor;

#[ctor]
fn install_autowrapt() {
    autowrapt::bootstrap();
}
