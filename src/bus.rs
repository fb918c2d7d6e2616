//! Event bus - typed events out, application commands in
//!
//! The bridge publishes through the [`EventSink`] trait so it does not depend
//! on any particular pub/sub implementation. [`EventBus`] is the in-process
//! implementation built on `tokio::sync::broadcast`.

use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;

use crate::state::CHANNEL_COUNT;

/// Default capacity of the broadcast channels
pub const DEFAULT_BUS_CAPACITY: usize = 256;

/// Events published by the bridge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum BridgeEvent {
    #[serde(rename_all = "camelCase")]
    HardwareConnected {
        timestamp: i64,
        parameter_values: [f64; CHANNEL_COUNT],
    },
    #[serde(rename_all = "camelCase")]
    HardwareDisconnected { timestamp: i64 },
    #[serde(rename_all = "camelCase")]
    HardwareConnectionError { message: String },
    #[serde(rename_all = "camelCase")]
    ParameterChanged {
        parameter_name: String,
        value: f64,
        channel_index: u8,
        delta: f64,
    },
}

impl BridgeEvent {
    /// Wire name of the event type
    pub fn kind(&self) -> &'static str {
        match self {
            BridgeEvent::HardwareConnected { .. } => "hardwareConnected",
            BridgeEvent::HardwareDisconnected { .. } => "hardwareDisconnected",
            BridgeEvent::HardwareConnectionError { .. } => "hardwareConnectionError",
            BridgeEvent::ParameterChanged { .. } => "parameterChanged",
        }
    }
}

/// Commands the surrounding application sends to the bridge
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", content = "payload", rename_all = "camelCase")]
pub enum ApplicationCommand {
    #[serde(rename_all = "camelCase")]
    ApplicationParameterChanged { parameter_name: String, value: f64 },
}

/// Outbound side of the bus, as seen by the bridge
pub trait EventSink: Send + Sync {
    fn publish(&self, event: BridgeEvent);
}

/// In-process event bus
#[derive(Clone)]
pub struct EventBus {
    events: broadcast::Sender<BridgeEvent>,
    commands: broadcast::Sender<ApplicationCommand>,
}

impl EventBus {
    pub fn new(capacity: usize) -> Self {
        let (events, _) = broadcast::channel(capacity);
        let (commands, _) = broadcast::channel(capacity);
        Self { events, commands }
    }

    /// Subscribe to bridge events
    pub fn subscribe(&self) -> broadcast::Receiver<BridgeEvent> {
        self.events.subscribe()
    }

    /// Send an application command to the bridge
    ///
    /// Returns false when nothing is listening (bridge not started).
    pub fn send_command(&self, command: ApplicationCommand) -> bool {
        self.commands.send(command).is_ok()
    }

    /// Subscribe to application commands
    pub fn subscribe_commands(&self) -> broadcast::Receiver<ApplicationCommand> {
        self.commands.subscribe()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(DEFAULT_BUS_CAPACITY)
    }
}

impl EventSink for EventBus {
    fn publish(&self, event: BridgeEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_event_json_shape() {
        let event = BridgeEvent::ParameterChanged {
            parameter_name: "volume".into(),
            value: 0.55,
            channel_index: 0,
            delta: 0.05,
        };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["type"], "parameterChanged");
        assert_eq!(json["payload"]["parameterName"], "volume");
        assert_eq!(json["payload"]["channelIndex"], 0);
        assert_eq!(event.kind(), "parameterChanged");
    }

    #[test]
    fn test_command_from_json() {
        let cmd: ApplicationCommand = serde_json::from_str(
            r#"{"type":"applicationParameterChanged","payload":{"parameterName":"reverb","value":1.4}}"#,
        )
        .unwrap();
        assert_eq!(
            cmd,
            ApplicationCommand::ApplicationParameterChanged {
                parameter_name: "reverb".into(),
                value: 1.4
            }
        );
    }

    #[tokio::test]
    async fn test_publish_reaches_subscribers() {
        let bus = EventBus::default();
        let mut rx = bus.subscribe();

        bus.publish(BridgeEvent::HardwareDisconnected { timestamp: 7 });

        assert_eq!(
            rx.recv().await.unwrap(),
            BridgeEvent::HardwareDisconnected { timestamp: 7 }
        );
    }

    #[test]
    fn test_publish_without_subscribers_is_ignored() {
        let bus = EventBus::default();
        bus.publish(BridgeEvent::HardwareConnectionError {
            message: "nope".into(),
        });
        assert!(!bus.send_command(ApplicationCommand::ApplicationParameterChanged {
            parameter_name: "volume".into(),
            value: 0.1,
        }));
    }
}
