//! Reusable multi-session fixtures

mod two_session;

pub use two_session::{PROVIDER, RecordingConsumer, TestSession, TwoSessionFixture};
