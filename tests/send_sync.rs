//! Send/Sync guarantees for core types.

use rstest::rstest;
use static_assertions::assert_impl_all;
use wirelog::{
    Endpoint, Level, LogRecord, Logger, LoggerConfig, LoggerOptions, Payload, RingBuffer,
    TransportState,
};

#[rstest]
fn logger_is_send_sync() {
    assert_impl_all!(Logger: Send, Sync);
}

#[rstest]
fn shared_components_are_send_sync() {
    assert_impl_all!(RingBuffer: Send, Sync);
    assert_impl_all!(LoggerConfig: Send, Sync, Clone);
    assert_impl_all!(LoggerOptions: Send, Sync, Copy);
    assert_impl_all!(Endpoint: Send, Sync, Clone);
    assert_impl_all!(TransportState: Send, Sync, Copy);
}

#[rstest]
fn record_types_are_send() {
    assert_impl_all!(LogRecord: Send, Clone);
    assert_impl_all!(Payload: Send, Clone);
    assert_impl_all!(Level: Send, Copy);
}
