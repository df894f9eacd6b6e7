//! Role-specific reactions to inbound messages.

use crate::link::Link;
use crate::trace::{stamp, TraceSink};
use relay_wire::{LedState, Message};
use tracing::debug;

/// Decides what a role does with one inbound message.
///
/// Runs on the receive loop; returns an optional message to enqueue on the
/// same link.
pub trait Reactor: Send + Sync {
    /// React to `message` received on `link`
    fn react(&self, link: &Link, message: Message, trace: &dyn TraceSink) -> Option<Message>;
}

/// Server-side thresholds
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ServerPolicy {
    /// LED commands are forwarded only above this temperature
    pub threshold: f64,
    /// Temperature after a forwarded command
    pub reset_to: f64,
    /// Send received heartbeats back to the client
    pub echo_heartbeats: bool,
}

impl Default for ServerPolicy {
    fn default() -> Self {
        Self {
            threshold: 90.0,
            reset_to: 70.0,
            echo_heartbeats: true,
        }
    }
}

/// Server role: gates LED commands on the simulated temperature
#[derive(Debug, Clone, Copy, Default)]
pub struct ServerReactor {
    policy: ServerPolicy,
}

impl ServerReactor {
    /// Create a reactor with the given policy
    pub fn new(policy: ServerPolicy) -> Self {
        Self { policy }
    }
}

impl Reactor for ServerReactor {
    fn react(&self, link: &Link, message: Message, trace: &dyn TraceSink) -> Option<Message> {
        match message {
            Message::Heartbeat => {
                trace.trace_line(&format!("{} Heartbeat", stamp()));
                self.policy.echo_heartbeats.then_some(Message::Heartbeat)
            }
            Message::LedCommand { pin, state } => {
                match link.reset_temperature_above(self.policy.threshold, self.policy.reset_to) {
                    Some(previous) => {
                        trace.trace_line(&format!("{} LEDMessage: [{} {}]", stamp(), pin, state));
                        debug!(
                            "Link {}: forwarding LED command at {:.2}, reset to {:.2}",
                            link.id(),
                            previous,
                            self.policy.reset_to
                        );
                        Some(message)
                    }
                    None => {
                        debug!(
                            "Link {}: dropped LED command, temperature {:.2} not above {:.2}",
                            link.id(),
                            link.temperature(),
                            self.policy.threshold
                        );
                        None
                    }
                }
            }
            Message::Temperature { value } => {
                debug!("Link {}: ignoring inbound temperature {:.2}", link.id(), value);
                None
            }
        }
    }
}

/// Client-side command settings
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ClientPolicy {
    /// Temperatures above this trigger an LED command
    pub threshold: f64,
    /// Pin addressed by the command
    pub pin: i32,
    /// State requested by the command
    pub state: LedState,
}

impl Default for ClientPolicy {
    fn default() -> Self {
        Self {
            threshold: 90.0,
            pin: 12,
            state: LedState::On,
        }
    }
}

/// Client role: answers high temperatures with an LED command
#[derive(Debug, Clone, Copy, Default)]
pub struct ClientReactor {
    policy: ClientPolicy,
}

impl ClientReactor {
    /// Create a reactor with the given policy
    pub fn new(policy: ClientPolicy) -> Self {
        Self { policy }
    }
}

impl Reactor for ClientReactor {
    fn react(&self, link: &Link, message: Message, trace: &dyn TraceSink) -> Option<Message> {
        match message {
            Message::Temperature { value } => {
                link.set_temperature(value);
                trace.trace_line(&format!("Receive Temperature: {value}"));
                (value > self.policy.threshold).then_some(Message::LedCommand {
                    pin: self.policy.pin,
                    state: self.policy.state,
                })
            }
            Message::LedCommand { .. } => {
                trace.trace_line(&format!("Receive {message}"));
                None
            }
            Message::Heartbeat => {
                trace.trace_line("Receive Heartbeat");
                None
            }
        }
    }
}
