//! EventBus: topic publisher plus the inbound control-topic side that
//! feeds `TriggerCoordinator`/`CameraSupervisor`/`Config`. The production
//! adapter is an MQTT client (`rumqttc`), since the egress shape (`topic`,
//! JSON payload) is MQTT-shaped.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use std::sync::Arc;
use std::time::Duration;

use crossbeam_channel::Sender;
use log::{error, info, warn};
use rumqttc::{Client, Event, MqttOptions, Packet, QoS};
use serde::Serialize;

use crate::error::EventBusError;

/// Inbound control messages, decoded off the subscribed topics and handed to
/// whichever component owns the reaction.
#[derive(Debug, Clone)]
pub enum ControlMessage {
    ResetCamera,
    ForceDetect { cam_ip: String },
    ChangeVar { key: String, value: String },
    TriggerDetection { cam_ip: String, lock_asset_id: Option<String> },
    StopDetection { cam_ip: String, lock_asset_id: String },
}

pub trait EventBus: Send + Sync {
    fn publish(&self, topic: &str, payload: &(impl Serialize + ?Sized)) -> Result<(), EventBusError>;
}

/// Topic-criticality-to-QoS mapping: heartbeats and scanner-identity beacons
/// are best-effort (QoS 0); detection/output events are QoS 1 so the cloud
/// side's message bus does not silently drop a match.
fn qos_for_topic(topic: &str) -> QoS {
    if topic.ends_with("heartbeat") || topic == "gocheckin/scanner_detected" {
        QoS::AtMostOnce
    } else {
        QoS::AtLeastOnce
    }
}

pub struct MqttEventBus {
    client: Client,
}

impl MqttEventBus {
    /// Connects, subscribes to the inbound control topics, and spawns the
    /// event loop thread that decodes them into `ControlMessage`s on
    /// `control_tx`.
    pub fn connect(
        broker_url: &str,
        thing_name: &str,
        control_tx: Sender<ControlMessage>,
    ) -> Result<Arc<Self>, EventBusError> {
        let mut opts = MqttOptions::parse_url(format!("{broker_url}?client_id=sentinel-{thing_name}"))
            .map_err(|e| EventBusError::Publish {
                topic: "connect".to_string(),
                source: e.to_string(),
            })?;
        opts.set_keep_alive(Duration::from_secs(30));

        let (client, mut connection) = Client::new(opts, 64);

        let subscribe_topics = [
            "gocheckin/reset_camera".to_string(),
            format!("gocheckin/{thing_name}/force_detect"),
            format!("gocheckin/{thing_name}/change_var"),
            "gocheckin/trigger_detection".to_string(),
            "gocheckin/stop_detection".to_string(),
        ];
        for topic in &subscribe_topics {
            client
                .subscribe(topic, QoS::AtLeastOnce)
                .map_err(|e| EventBusError::Publish {
                    topic: topic.clone(),
                    source: e.to_string(),
                })?;
        }

        std::thread::spawn(move || {
            for notification in connection.iter() {
                match notification {
                    Ok(Event::Incoming(Packet::Publish(publish))) => {
                        if let Some(msg) = decode_control_message(&publish.topic, &publish.payload) {
                            if control_tx.try_send(msg).is_err() {
                                error!("control message queue full, dropping {}", publish.topic);
                            }
                        }
                    }
                    Ok(_) => {}
                    Err(e) => {
                        warn!("mqtt connection error: {e}");
                    }
                }
            }
        });

        Ok(Arc::new(MqttEventBus { client }))
    }
}

impl EventBus for MqttEventBus {
    fn publish(&self, topic: &str, payload: &(impl Serialize + ?Sized)) -> Result<(), EventBusError> {
        let json = serde_json::to_vec(payload).map_err(|e| EventBusError::Publish {
            topic: topic.to_string(),
            source: e.to_string(),
        })?;
        self.client
            .publish(topic, qos_for_topic(topic), false, json)
            .map_err(|e| EventBusError::Publish {
                topic: topic.to_string(),
                source: e.to_string(),
            })?;
        info!("published to {topic}");
        Ok(())
    }
}

fn decode_control_message(topic: &str, payload: &[u8]) -> Option<ControlMessage> {
    #[derive(serde::Deserialize)]
    struct ForceDetectBody {
        cam_ip: String,
    }
    #[derive(serde::Deserialize)]
    struct ChangeVarBody {
        key: String,
        value: String,
    }
    #[derive(serde::Deserialize)]
    struct TriggerBody {
        cam_ip: String,
        lock_asset_id: Option<String>,
    }
    #[derive(serde::Deserialize)]
    struct StopBody {
        cam_ip: String,
        lock_asset_id: String,
    }

    if topic == "gocheckin/reset_camera" {
        return Some(ControlMessage::ResetCamera);
    }
    if topic.ends_with("force_detect") {
        let body: ForceDetectBody = serde_json::from_slice(payload).ok()?;
        return Some(ControlMessage::ForceDetect { cam_ip: body.cam_ip });
    }
    if topic.ends_with("change_var") {
        let body: ChangeVarBody = serde_json::from_slice(payload).ok()?;
        return Some(ControlMessage::ChangeVar {
            key: body.key,
            value: body.value,
        });
    }
    if topic == "gocheckin/trigger_detection" {
        let body: TriggerBody = serde_json::from_slice(payload).ok()?;
        return Some(ControlMessage::TriggerDetection {
            cam_ip: body.cam_ip,
            lock_asset_id: body.lock_asset_id,
        });
    }
    if topic == "gocheckin/stop_detection" {
        let body: StopBody = serde_json::from_slice(payload).ok()?;
        return Some(ControlMessage::StopDetection {
            cam_ip: body.cam_ip,
            lock_asset_id: body.lock_asset_id,
        });
    }
    None
}

/// In-process adapter for tests: records every publish, never connects to a
/// broker.
#[cfg(test)]
pub struct InMemoryEventBus {
    pub published: parking_lot::Mutex<Vec<(String, String)>>,
}

#[cfg(test)]
impl InMemoryEventBus {
    pub fn new() -> Arc<Self> {
        Arc::new(InMemoryEventBus {
            published: parking_lot::Mutex::new(Vec::new()),
        })
    }
}

#[cfg(test)]
impl EventBus for InMemoryEventBus {
    fn publish(&self, topic: &str, payload: &(impl Serialize + ?Sized)) -> Result<(), EventBusError> {
        let json = serde_json::to_string(payload).map_err(|e| EventBusError::Publish {
            topic: topic.to_string(),
            source: e.to_string(),
        })?;
        self.published.lock().push((topic.to_string(), json));
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn heartbeat_topics_use_at_most_once() {
        assert_eq!(qos_for_topic("gocheckin/thing/camera_heartbeat"), QoS::AtMostOnce);
        assert_eq!(qos_for_topic("gocheckin/thing/member_detected"), QoS::AtLeastOnce);
    }

    #[test]
    fn in_memory_bus_records_publish() {
        let bus = InMemoryEventBus::new();
        bus.publish("gocheckin/scanner_detected", &serde_json::json!({"assetId": "a1"}))
            .unwrap();
        assert_eq!(bus.published.lock().len(), 1);
    }
}
