mod mock_http;
mod mock_server;

mod connection_test;
mod reconnect_test;
mod token_test;

use rdplink::{EventCode, SessionEvent};
use std::sync::{Arc, Mutex};
use std::time::Duration;

pub type Events = Arc<Mutex<Vec<SessionEvent>>>;

pub fn init_logging() {
    let _ = tracing_subscriber::fmt().with_test_writer().try_init();
}

/// Polls `condition` every 20ms until it holds or `within` elapses.
pub async fn wait_until<F: Fn() -> bool>(condition: F, within: Duration) -> bool {
    let deadline = tokio::time::Instant::now() + within;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
    condition()
}

pub fn codes(events: &Events) -> Vec<EventCode> {
    events.lock().unwrap().iter().map(|event| event.code).collect()
}
