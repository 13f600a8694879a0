//! Environment configuration for the bootstrap decision.
//!
//! Two variables can turn the feature on: the allow-list variable, where
//! `supermeter` must appear as an exact comma-separated element, and the
//! boolean flag variable. Both are read at decision time, never earlier.

/// Comma-separated allow-list of packages to bootstrap.
pub const BOOTSTRAP_LIST_VAR: &str = "AUTOWRAPT_BOOTSTRAP";
/// Boolean flag enabling the supermeter bootstrap on its own.
pub const BOOTSTRAP_FLAG_VAR: &str = "SUPERMETER_BOOTSTRAP";
/// Boolean flag enabling debug lines on stderr.
pub const DEBUG_VAR: &str = "SUPERTENANT_SUPERMETER_AUTOWRAPT_DEBUG";

const BOOTSTRAP_TOKEN: &str = "supermeter";

/// The truthy-string set shared by every boolean-like variable.
pub fn truthy(value: &str) -> bool {
    matches!(
        value.to_ascii_lowercase().as_str(),
        "1" | "true" | "t" | "y" | "yes"
    )
}

/// Whether the environment asks for the supermeter bootstrap.
pub fn bootstrap_enabled() -> bool {
    enabled_from(
        std::env::var(BOOTSTRAP_LIST_VAR).ok().as_deref(),
        std::env::var(BOOTSTRAP_FLAG_VAR).ok().as_deref(),
    )
}

fn enabled_from(list: Option<&str>, flag: Option<&str>) -> bool {
    if let Some(list) = list {
        // Exact element match; "supermeterx" must not count.
        if list.split(',').any(|token| token == BOOTSTRAP_TOKEN) {
            return true;
        }
    }
    flag.is_some_and(truthy)
}
