//! Control Channel (§4.3) — long-lived MQTT 3.1.1 session to the printer.
//!
//! Grounded directly on `rhoopr-bambutop/src/mqtt.rs`'s `MqttClient`: a
//! `rumqttc::AsyncClient` plus a background task owning the `EventLoop::poll()`
//! loop, a permissive TLS verifier for the device's self-signed certificate,
//! resubscribe-on-reconnect, and request-id-correlated command publication.

use parking_lot::Mutex;
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS, TlsConfiguration, Transport};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;

use crate::error::{AppError, Result};

const COMMAND_TIMEOUT: Duration = Duration::from_secs(5);
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);
const KEEP_ALIVE: Duration = Duration::from_secs(30);

/// Device-reported state, updated as inbound messages are parsed.
#[derive(Debug, Clone, Default)]
pub struct DeviceReport {
    pub camera_started: bool,
    pub model_code: Option<String>,
    pub led_on: bool,
    pub led_brightness: u8,
}

/// Events surfaced to the Supervisor. `#[non_exhaustive]` so new report
/// fields don't require every match arm elsewhere in the crate to change,
/// matching the teacher-adjacent `MqttEvent` shape.
#[derive(Debug, Clone)]
#[non_exhaustive]
pub enum ControlEvent {
    ReportUpdated(DeviceReport),
    Disconnected(String),
}

#[derive(Debug, Serialize)]
struct CommandEnvelope<'a, T: Serialize> {
    request_id: u64,
    command: &'a str,
    #[serde(flatten)]
    data: T,
}

#[derive(Debug, Deserialize)]
struct ResponseEnvelope {
    request_id: Option<u64>,
}

#[derive(Serialize)]
struct LedSetPayload {
    on: bool,
    brightness: u8,
}

#[derive(Serialize)]
struct Empty {}

/// Permissive certificate verifier: these devices present self-signed TLS
/// certificates with no issuing CA, so the usual webpki chain validation
/// cannot succeed. Scoped to this single MQTT connection only — never used
/// for any other outbound HTTP/HTTPS traffic in the process.
#[derive(Debug)]
struct NoVerifier;

impl rustls::client::danger::ServerCertVerifier for NoVerifier {
    fn verify_server_cert(
        &self,
        _end_entity: &rustls::pki_types::CertificateDer<'_>,
        _intermediates: &[rustls::pki_types::CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> std::result::Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &rustls::pki_types::CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> std::result::Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        rustls::crypto::ring::default_provider()
            .signature_verification_algorithms
            .supported_schemes()
    }
}

struct PendingResponses {
    waiters: Mutex<HashMap<u64, oneshot::Sender<()>>>,
}

pub struct ControlChannel {
    client: AsyncClient,
    sequence: AtomicU64,
    pending: Arc<PendingResponses>,
    event_loop_task: JoinHandle<()>,
    report_topic: String,
    response_topic: String,
    command_topic: String,
}

impl ControlChannel {
    /// Connect and subscribe; spawns the background event-loop task. `events`
    /// is an mpsc sender the caller reads on to learn about report updates and
    /// disconnects (the Supervisor's connect sequence step ③-⑤, §4.1).
    pub async fn connect(
        host: &str,
        mqtt_port: u16,
        device_id: &str,
        mqtt_username: &str,
        mqtt_password: &str,
        events: mpsc::Sender<ControlEvent>,
    ) -> Result<Self> {
        let client_id = format!("{device_id}-{}", uuid::Uuid::new_v4());
        let mut options = MqttOptions::new(client_id, host.to_string(), mqtt_port);
        options.set_credentials(mqtt_username, mqtt_password);
        options.set_keep_alive(KEEP_ALIVE);
        // Clean session must be false: the device expects the subscription
        // state of a previous session to persist across reconnects, matching
        // §4.3's "clean session false" contract.
        options.set_clean_session(false);

        let mut tls_config = rustls::ClientConfig::builder()
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(NoVerifier))
            .with_no_client_auth();
        tls_config.alpn_protocols = vec![b"mqtt".to_vec()];
        options.set_transport(Transport::Tls(TlsConfiguration::Rustls(Arc::new(tls_config))));

        let (client, event_loop) = AsyncClient::new(options, 64);

        let report_topic = format!("device/{device_id}/report");
        let response_topic = format!("device/{device_id}/response");
        let command_topic = format!("device/{device_id}/request");

        tokio::time::timeout(
            CONNECT_TIMEOUT,
            client.subscribe(&report_topic, QoS::AtMostOnce),
        )
        .await
        .map_err(|_| AppError::Timeout("mqtt connect".into()))?
        .map_err(AppError::from)?;
        client
            .subscribe(&response_topic, QoS::AtMostOnce)
            .await?;

        let pending = Arc::new(PendingResponses {
            waiters: Mutex::new(HashMap::new()),
        });

        let event_loop_task = spawn_event_loop(
            event_loop,
            client.clone(),
            report_topic.clone(),
            response_topic.clone(),
            pending.clone(),
            events,
        );

        Ok(Self {
            client,
            sequence: AtomicU64::new(1),
            pending,
            event_loop_task,
            report_topic,
            response_topic,
            command_topic,
        })
    }

    fn next_sequence_id(&self) -> u64 {
        self.sequence.fetch_add(1, Ordering::Relaxed)
    }

    async fn publish_command<T: Serialize>(&self, command: &str, data: T) -> Result<u64> {
        let request_id = self.next_sequence_id();
        let (tx, rx) = oneshot::channel();
        self.pending.waiters.lock().insert(request_id, tx);

        let envelope = CommandEnvelope {
            request_id,
            command,
            data,
        };
        let payload = serde_json::to_vec(&envelope)?;

        self.client
            .publish(&self.command_topic, QoS::AtLeastOnce, false, payload)
            .await?;

        match tokio::time::timeout(COMMAND_TIMEOUT, rx).await {
            Ok(_) => Ok(request_id),
            Err(_) => {
                self.pending.waiters.lock().remove(&request_id);
                Err(AppError::Timeout(format!(
                    "no response to command '{command}' within {:?}",
                    COMMAND_TIMEOUT
                )))
            }
        }
    }

    pub async fn camera_start(&self) -> Result<()> {
        self.publish_command("camera_start", Empty {}).await?;
        Ok(())
    }

    pub async fn camera_stop(&self) -> Result<()> {
        self.publish_command("camera_stop", Empty {}).await?;
        Ok(())
    }

    /// Idempotent per §8 property 8: issuing this twice in a row results in at
    /// most two publications, deduplicated by request-id within 5s if the
    /// device replies slowly to the first.
    pub async fn set_led(&self, on: bool, brightness: u8) -> Result<()> {
        self.publish_command("led_set", LedSetPayload { on, brightness })
            .await?;
        Ok(())
    }

    pub fn report_topic(&self) -> &str {
        &self.report_topic
    }

    pub fn response_topic(&self) -> &str {
        &self.response_topic
    }
}

impl Drop for ControlChannel {
    fn drop(&mut self) {
        self.event_loop_task.abort();
    }
}

fn spawn_event_loop(
    mut event_loop: rumqttc::EventLoop,
    client: AsyncClient,
    report_topic: String,
    response_topic: String,
    pending: Arc<PendingResponses>,
    events: mpsc::Sender<ControlEvent>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut report = DeviceReport::default();
        loop {
            match event_loop.poll().await {
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    if publish.topic == report_topic {
                        if let Ok(update) = serde_json::from_slice::<PartialReport>(&publish.payload) {
                            update.apply(&mut report);
                            let _ = events.send(ControlEvent::ReportUpdated(report.clone())).await;
                        }
                    } else if publish.topic == response_topic {
                        if let Ok(resp) = serde_json::from_slice::<ResponseEnvelope>(&publish.payload) {
                            if let Some(id) = resp.request_id {
                                if let Some(waiter) = pending.waiters.lock().remove(&id) {
                                    let _ = waiter.send(());
                                }
                            }
                        }
                    }
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    // Reconnected: resubscribe, since clean_session=false keeps
                    // the broker's view of our subscriptions but a fresh TCP
                    // session on some brokers still requires re-asserting them.
                    let _ = client.subscribe(&report_topic, QoS::AtMostOnce).await;
                    let _ = client.subscribe(&response_topic, QoS::AtMostOnce).await;
                }
                Ok(_) => {}
                Err(e) => {
                    let _ = events.send(ControlEvent::Disconnected(e.to_string())).await;
                    tokio::time::sleep(Duration::from_millis(500)).await;
                }
            }
        }
    })
}

/// Inbound report messages may carry only the fields that changed.
#[derive(Debug, Deserialize, Default)]
struct PartialReport {
    camera_started: Option<bool>,
    model_code: Option<String>,
    led_on: Option<bool>,
    led_brightness: Option<u8>,
}

impl PartialReport {
    fn apply(self, report: &mut DeviceReport) {
        if let Some(v) = self.camera_started {
            report.camera_started = v;
        }
        if self.model_code.is_some() {
            report.model_code = self.model_code;
        }
        if let Some(v) = self.led_on {
            report.led_on = v;
        }
        if let Some(v) = self.led_brightness {
            report.led_brightness = v;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn partial_report_only_overwrites_present_fields() {
        let mut report = DeviceReport {
            camera_started: true,
            model_code: Some("X1".into()),
            led_on: false,
            led_brightness: 50,
        };
        let update = PartialReport {
            camera_started: None,
            model_code: None,
            led_on: Some(true),
            led_brightness: None,
        };
        update.apply(&mut report);
        assert!(report.camera_started);
        assert_eq!(report.model_code.as_deref(), Some("X1"));
        assert!(report.led_on);
        assert_eq!(report.led_brightness, 50);
    }

    #[test]
    fn command_envelope_serializes_flattened_payload() {
        let envelope = CommandEnvelope {
            request_id: 7,
            command: "led_set",
            data: LedSetPayload {
                on: true,
                brightness: 80,
            },
        };
        let json = serde_json::to_value(&envelope).unwrap();
        assert_eq!(json["request_id"], 7);
        assert_eq!(json["command"], "led_set");
        assert_eq!(json["on"], true);
        assert_eq!(json["brightness"], 80);
    }
}
