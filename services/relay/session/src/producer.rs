//! Periodic producers feeding a link's outbound queue.
//!
//! Both producers tick on a fixed interval while their link is open and stop
//! as soon as it leaves `Open` or its queue is closed.

use crate::link::Link;
use crate::trace::{stamp, TraceSink};
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use relay_wire::Message;
use std::time::Duration;
use tokio::time::{interval, MissedTickBehavior};
use tracing::debug;

/// Server-side temperature source.
///
/// Each tick adds a random step in `[0, range)` to the link's temperature
/// and sends the new value to the client.
#[derive(Debug)]
pub struct TelemetrySimulator {
    interval: Duration,
    range: f64,
    rng: StdRng,
}

impl TelemetrySimulator {
    /// Simulator seeded from the OS
    pub fn new(interval: Duration, range: f64) -> Self {
        Self::with_rng(interval, range, StdRng::from_entropy())
    }

    /// Simulator with a caller-supplied generator
    pub fn with_rng(interval: Duration, range: f64, rng: StdRng) -> Self {
        Self { interval, range, rng }
    }

    /// Produce readings until the link stops being open.
    ///
    /// The first reading goes out as soon as the link opens.
    pub async fn run(mut self, link: &Link, trace: &dyn TraceSink) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = link.closed() => break,
                _ = ticker.tick() => {}
            }

            let value = link.advance_temperature(self.rng.gen::<f64>() * self.range);
            if link.queue().push(Message::Temperature { value }).await.is_err() {
                break;
            }
            trace.trace_line(&format!("{} Current Temperature: {:.2}", stamp(), value));
        }
        debug!("Telemetry for link {} stopped", link.id());
    }
}

/// Client-side liveness signal
#[derive(Debug, Clone, Copy)]
pub struct HeartbeatProducer {
    interval: Duration,
}

impl HeartbeatProducer {
    /// Producer emitting one heartbeat per `interval`
    pub fn new(interval: Duration) -> Self {
        Self { interval }
    }

    /// Produce heartbeats until the link stops being open
    pub async fn run(self, link: &Link) {
        let mut ticker = interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = link.closed() => break,
                _ = ticker.tick() => {}
            }

            if link.queue().push(Message::Heartbeat).await.is_err() {
                break;
            }
        }
        debug!("Heartbeats for link {} stopped", link.id());
    }
}
