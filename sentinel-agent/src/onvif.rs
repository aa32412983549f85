//! ONVIF WS-Events client: push-mode Subscribe/Renew/Unsubscribe over raw
//! SOAP, plus the WS-Notification envelope parser the `/onvif_notifications`
//! handler uses. Grounded on `onvif_process.py`'s `OnvifConnector` -- that
//! code drives the same three operations through `zeep`; here they're hand
//! built SOAP envelopes over `reqwest::blocking`, matching the `artifact_sink`
//! module's use of the crate for signed-request plumbing.
//!
//! SPDX-License-Identifier: GPL-3.0-or-later

use std::collections::HashMap;
use std::sync::Arc;

use log::{debug, error, warn};
use parking_lot::Mutex;
use reqwest::blocking::Client;
use serde::Deserialize;

use sentinel_core::camera_supervisor::OnvifClient;
use sentinel_core::error::SupervisorError;
use sentinel_core::models::Camera;

const WSA_NS: &str = "http://www.w3.org/2005/08/addressing";
const WSNT_NS: &str = "http://docs.oasis-open.org/wsn/b-2";

/// One detected motion notification, resolved to a camera IP.
#[derive(Debug, Clone, PartialEq)]
pub struct MotionNotification {
    pub cam_ip: String,
    pub utc_time: Option<String>,
    pub is_motion: bool,
}

/// HTTP-backed `OnvifClient`. Subscription addresses are kept in memory,
/// keyed by camera IP, the same lifetime `onvif_process.py`'s
/// `camera_item['onvifSubAddress']` field has -- lost on restart, which is
/// fine because a lost subscription is just re-subscribed on the next
/// reconcile pass.
pub struct OnvifHttpClient {
    http: Client,
    scanner_local_ip: String,
    http_port: u16,
    subscriptions: Mutex<HashMap<String, String>>,
}

impl OnvifHttpClient {
    pub fn new(scanner_local_ip: String, http_port: u16) -> Arc<Self> {
        Arc::new(OnvifHttpClient {
            http: Client::builder()
                .timeout(std::time::Duration::from_secs(10))
                .build()
                .expect("reqwest client builds"),
            scanner_local_ip,
            http_port,
            subscriptions: Mutex::new(HashMap::new()),
        })
    }

    fn service_url(&self, cam: &Camera) -> Result<String, SupervisorError> {
        let onvif = cam.onvif.as_ref().ok_or_else(|| SupervisorError::OnvifSubscribe {
            cam_ip: cam.cam_ip.clone(),
            source: "camera has no onvif descriptor".to_string(),
        })?;
        let host = if cam.cam_ip.starts_with("http://") || cam.cam_ip.starts_with("https://") {
            cam.cam_ip.clone()
        } else {
            format!("http://{}", cam.cam_ip)
        };
        Ok(format!("{host}:{}/onvif/Events", onvif.port))
    }

    fn post_soap(&self, url: &str, body: &str, soap_action: &str) -> Result<String, String> {
        let resp = self
            .http
            .post(url)
            .header("Content-Type", "application/soap+xml; charset=utf-8")
            .header("SOAPAction", soap_action)
            .body(body.to_string())
            .send()
            .map_err(|e| e.to_string())?;
        let status = resp.status();
        let text = resp.text().map_err(|e| e.to_string())?;
        if !status.is_success() {
            return Err(format!("HTTP {status}: {text}"));
        }
        Ok(text)
    }

    fn subscribe(&self, cam: &Camera, termination: &str) -> Result<String, String> {
        let url = self
            .service_url(cam)
            .map_err(|e| e.to_string())?;
        let consumer_ref = format!(
            "http://{}:{}/onvif_notifications",
            self.scanner_local_ip, self.http_port
        );
        let body = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" xmlns:wsa="{WSA_NS}">
  <s:Header/>
  <s:Body>
    <Subscribe xmlns="{WSNT_NS}">
      <ConsumerReference>
        <wsa:Address>{consumer_ref}</wsa:Address>
      </ConsumerReference>
      <InitialTerminationTime>{termination}</InitialTerminationTime>
    </Subscribe>
  </s:Body>
</s:Envelope>"#
        );
        let response = self.post_soap(&url, &body, "http://docs.oasis-open.org/wsn/bw-2/NotificationProducer/SubscribeRequest")?;
        let parsed: SubscribeEnvelope = serde_xml_rs::from_str(&response).map_err(|e| e.to_string())?;
        Ok(parsed.body.subscribe_response.subscription_reference.address)
    }

    fn renew(&self, cam: &Camera, existing_address: &str, termination: &str) -> Result<String, String> {
        let body = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" xmlns:wsa="{WSA_NS}">
  <s:Header>
    <wsa:To>{existing_address}</wsa:To>
  </s:Header>
  <s:Body>
    <Renew xmlns="{WSNT_NS}">
      <TerminationTime>{termination}</TerminationTime>
    </Renew>
  </s:Body>
</s:Envelope>"#
        );
        self.post_soap(existing_address, &body, "http://docs.oasis-open.org/wsn/bw-2/SubscriptionManager/RenewRequest")?;
        debug!("{} onvif renew ok", cam.cam_ip);
        Ok(existing_address.to_string())
    }
}

impl OnvifClient for OnvifHttpClient {
    fn subscribe_or_renew(&self, cam: &Camera, termination: &str) -> Result<(), SupervisorError> {
        let existing = self.subscriptions.lock().get(&cam.cam_ip).cloned();

        let result = match existing {
            Some(address) => self
                .renew(cam, &address, termination)
                .or_else(|e| {
                    warn!("{} onvif renew failed ({e}), re-subscribing", cam.cam_ip);
                    self.subscribe(cam, termination)
                }),
            None => self.subscribe(cam, termination),
        };

        match result {
            Ok(address) => {
                self.subscriptions.lock().insert(cam.cam_ip.clone(), address);
                Ok(())
            }
            Err(source) => Err(SupervisorError::OnvifSubscribe {
                cam_ip: cam.cam_ip.clone(),
                source,
            }),
        }
    }

    fn unsubscribe(&self, cam: &Camera) -> Result<(), SupervisorError> {
        let address = self.subscriptions.lock().remove(&cam.cam_ip);
        let Some(address) = address else {
            return Ok(());
        };
        let body = format!(
            r#"<?xml version="1.0" encoding="UTF-8"?>
<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope" xmlns:wsa="{WSA_NS}">
  <s:Header>
    <wsa:To>{address}</wsa:To>
  </s:Header>
  <s:Body>
    <Unsubscribe xmlns="{WSNT_NS}"/>
  </s:Body>
</s:Envelope>"#
        );
        if let Err(e) = self.post_soap(&address, &body, "http://docs.oasis-open.org/wsn/bw-2/SubscriptionManager/UnsubscribeRequest") {
            error!("{} onvif unsubscribe failed: {e}", cam.cam_ip);
        }
        Ok(())
    }
}

#[derive(Debug, Deserialize)]
struct SubscribeEnvelope {
    #[serde(rename = "Body")]
    body: SubscribeBody,
}

#[derive(Debug, Deserialize)]
struct SubscribeBody {
    #[serde(rename = "SubscribeResponse")]
    subscribe_response: SubscribeResponse,
}

#[derive(Debug, Deserialize)]
struct SubscribeResponse {
    #[serde(rename = "SubscriptionReference")]
    subscription_reference: SubscriptionReferenceElement,
}

#[derive(Debug, Deserialize)]
struct SubscriptionReferenceElement {
    #[serde(rename = "Address")]
    address: String,
}

// Shape of an inbound WS-Notification push, mirroring the handful of fields
// `OnvifConnector.extract_notification` pulls out with ElementTree.find().
// serde-xml-rs matches by local element/attribute name regardless of the
// namespace prefix a given camera firmware happens to use.
#[derive(Debug, Deserialize)]
struct NotifyEnvelope {
    #[serde(rename = "Body")]
    body: NotifyBody,
}

#[derive(Debug, Deserialize)]
struct NotifyBody {
    #[serde(rename = "Notify")]
    notify: Notify,
}

#[derive(Debug, Deserialize)]
struct Notify {
    #[serde(rename = "NotificationMessage")]
    notification_message: NotificationMessage,
}

#[derive(Debug, Deserialize)]
struct NotificationMessage {
    #[serde(rename = "SubscriptionReference")]
    subscription_reference: Option<SubscriptionReferenceElement>,
    #[serde(rename = "Topic")]
    topic: TopicElement,
    #[serde(rename = "Message")]
    message: MessageWrapper,
}

#[derive(Debug, Deserialize)]
struct TopicElement {
    #[serde(rename = "$value")]
    value: String,
}

#[derive(Debug, Deserialize)]
struct MessageWrapper {
    #[serde(rename = "Message")]
    inner: InnerMessage,
}

#[derive(Debug, Deserialize)]
struct InnerMessage {
    #[serde(rename = "UtcTime")]
    utc_time: Option<String>,
    #[serde(rename = "Data")]
    data: DataElement,
}

#[derive(Debug, Deserialize)]
struct DataElement {
    #[serde(rename = "SimpleItem")]
    simple_items: Vec<SimpleItem>,
}

#[derive(Debug, Deserialize)]
struct SimpleItem {
    #[serde(rename = "Name")]
    name: String,
    #[serde(rename = "Value")]
    value: String,
}

/// Parses an inbound WS-Notification envelope and, if it carries a
/// `tns1:RuleEngine/CellMotionDetector/Motion` topic, returns the extracted
/// motion event. `client_ip` is the fallback camera IP used when the
/// envelope's `SubscriptionReference/Address` can't be resolved to a host,
/// matching `OnvifConnector.extract_notification`.
pub fn extract_notification(raw_payload: &str, client_ip: &str) -> Option<MotionNotification> {
    let envelope: NotifyEnvelope = serde_xml_rs::from_str(raw_payload).ok()?;
    let message = envelope.body.notify.notification_message;

    if message.topic.value.trim() != "tns1:RuleEngine/CellMotionDetector/Motion" {
        return None;
    }

    let cam_ip = message
        .subscription_reference
        .as_ref()
        .and_then(|r| reqwest::Url::parse(r.address.trim()).ok())
        .and_then(|u| u.host_str().map(str::to_string))
        .unwrap_or_else(|| client_ip.to_string());

    let is_motion = message
        .message
        .inner
        .data
        .simple_items
        .iter()
        .find(|item| item.name == "IsMotion")
        .map(|item| item.value.eq_ignore_ascii_case("true"))?;

    Some(MotionNotification {
        cam_ip,
        utc_time: message.message.inner.utc_time,
        is_motion,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"<?xml version="1.0"?>
<s:Envelope xmlns:s="http://www.w3.org/2003/05/soap-envelope"
            xmlns:wsa="http://www.w3.org/2005/08/addressing"
            xmlns:wsnt="http://docs.oasis-open.org/wsn/b-2"
            xmlns:tt="http://www.onvif.org/ver10/schema">
  <s:Body>
    <wsnt:Notify>
      <wsnt:NotificationMessage>
        <wsnt:SubscriptionReference>
          <wsa:Address>http://192.168.1.50:8080/onvif_notifications</wsa:Address>
        </wsnt:SubscriptionReference>
        <wsnt:Topic>tns1:RuleEngine/CellMotionDetector/Motion</wsnt:Topic>
        <wsnt:Message>
          <tt:Message UtcTime="2026-07-27T10:00:00Z">
            <tt:Data>
              <tt:SimpleItem Name="IsMotion" Value="true"/>
            </tt:Data>
          </tt:Message>
        </wsnt:Message>
      </wsnt:NotificationMessage>
    </wsnt:Notify>
  </s:Body>
</s:Envelope>"#;

    #[test]
    fn extracts_motion_true_with_cam_ip_from_address() {
        let n = extract_notification(SAMPLE, "10.0.0.9").unwrap();
        assert_eq!(n.cam_ip, "192.168.1.50");
        assert!(n.is_motion);
        assert_eq!(n.utc_time.as_deref(), Some("2026-07-27T10:00:00Z"));
    }

    #[test]
    fn non_motion_topic_is_ignored() {
        let other = SAMPLE.replace(
            "tns1:RuleEngine/CellMotionDetector/Motion",
            "tns1:RuleEngine/TamperDetector/Tamper",
        );
        assert!(extract_notification(&other, "10.0.0.9").is_none());
    }

    #[test]
    fn missing_address_falls_back_to_client_ip() {
        let no_addr = SAMPLE.replace(
            "<wsa:Address>http://192.168.1.50:8080/onvif_notifications</wsa:Address>",
            "",
        );
        let n = extract_notification(&no_addr, "10.0.0.9").unwrap();
        assert_eq!(n.cam_ip, "10.0.0.9");
    }
}
