use std::time::Duration;

use macvtap_device_plugin::ShutdownSignals;
use nix::sys::signal::{raise, Signal};

#[tokio::test]
async fn sigterm_requests_shutdown() {
    let mut signals = ShutdownSignals::new().unwrap();

    raise(Signal::SIGTERM).unwrap();

    let name = tokio::time::timeout(Duration::from_secs(5), signals.recv())
        .await
        .expect("SIGTERM was not delivered");
    assert_eq!(name, "SIGTERM");
}
