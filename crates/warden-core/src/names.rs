//! Naming rules for resource keys and FSM state names.

use lazy_static::lazy_static;
use regex::Regex;

lazy_static! {
    /// Resource keys: provider names, tool names, host:port pairs
    pub static ref RESOURCE_KEY_PATTERN: Regex = Regex::new(
        r"^[A-Za-z0-9][A-Za-z0-9_.:-]*$"
    ).unwrap();

    /// State names: lowercase identifiers ("half_open", "synthesize")
    pub static ref STATE_NAME_PATTERN: Regex = Regex::new(
        r"^[a-z][a-z0-9_]*$"
    ).unwrap();
}

/// Check whether a string is a valid resource key.
pub fn is_valid_resource_key(key: &str) -> bool {
    RESOURCE_KEY_PATTERN.is_match(key)
}

/// Check whether a string is a valid state name.
pub fn is_valid_state_name(name: &str) -> bool {
    STATE_NAME_PATTERN.is_match(name)
}
