//! Process-wide serial-device blocklist (§5, §9): the only shared mutable
//! state in the core. Exploratory opens that fail (libnfc UART detection,
//! go-pn532 detection probing unrelated USB devices) add to this set so
//! later detection passes don't keep disturbing the same dead device.

use std::collections::BTreeSet;
use std::sync::RwLock;

static BLOCKLIST: RwLock<BTreeSet<String>> = RwLock::new(BTreeSet::new());

/// Marks `path` as known-bad for auto-detection purposes.
pub fn add(path: &str) {
    let mut set = BLOCKLIST.write().unwrap();
    set.insert(path.to_string());
}

/// True iff `path` was previously marked bad.
pub fn is_blocked(path: &str) -> bool {
    BLOCKLIST.read().unwrap().contains(path)
}

/// Removes every entry. Exposed for tests; production code never needs to
/// un-block a device within a process lifetime.
#[cfg(test)]
pub fn clear() {
    BLOCKLIST.write().unwrap().clear();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn add_then_check() {
        clear();
        assert!(!is_blocked("/dev/ttyUSB-blocklist-test"));
        add("/dev/ttyUSB-blocklist-test");
        assert!(is_blocked("/dev/ttyUSB-blocklist-test"));
        assert!(!is_blocked("/dev/ttyUSB-other"));
        clear();
    }
}
