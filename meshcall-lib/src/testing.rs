mod engine;
mod relay;
mod transport;

use std::{num::NonZeroU8, sync::Once, time::Duration};

use time::format_description::well_known::{
    iso8601::{self, EncodedConfig},
    Iso8601,
};
use tokio::time::{sleep, Instant};
use tracing_subscriber::{fmt::time::LocalTime, EnvFilter};

pub(crate) use engine::{FakeNetwork, RecordedCall};
pub(crate) use relay::RelayHub;
pub(crate) use transport::{ScriptedTransport, TransportCall};

pub(crate) fn init_tracing() {
    const TIME_FORMAT: EncodedConfig = iso8601::Config::DEFAULT
        .set_time_precision(iso8601::TimePrecision::Second {
            decimal_digits: NonZeroU8::new(6),
        })
        .encode();
    static INIT: Once = Once::new();
    INIT.call_once(|| {
        let filter = EnvFilter::try_from_default_env()
            .unwrap_or_else(|_| EnvFilter::new(concat!(env!("CARGO_CRATE_NAME"), "=trace")));
        let _ = tracing_subscriber::fmt()
            .compact()
            .with_timer(LocalTime::new(Iso8601::<TIME_FORMAT>))
            .with_thread_ids(true)
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}

/// Polls `condition` until it holds, panicking after a generous deadline.
pub(crate) async fn eventually(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while !condition() {
        if Instant::now() > deadline {
            panic!("timed out waiting for {}", what);
        }
        sleep(Duration::from_millis(1)).await;
    }
}
