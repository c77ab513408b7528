//! Process-wide default logger registry.

use std::sync::Arc;

use serial_test::serial;
use wirelog::{Logger, clear_default, default_logger, set_default};

#[test]
#[serial]
fn registry_starts_empty_and_round_trips() {
    clear_default();
    assert!(default_logger().is_none());

    let logger = Arc::new(Logger::new());
    set_default(Arc::clone(&logger));
    let fetched = default_logger().expect("default installed");
    assert!(Arc::ptr_eq(&logger, &fetched));

    clear_default();
    assert!(default_logger().is_none());
}

#[test]
#[serial]
fn installing_again_replaces_the_default() {
    let first = Arc::new(Logger::new());
    let second = Arc::new(Logger::new());
    set_default(Arc::clone(&first));
    set_default(Arc::clone(&second));

    let fetched = default_logger().expect("default installed");
    assert!(Arc::ptr_eq(&second, &fetched));
    clear_default();
}
