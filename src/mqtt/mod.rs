use std::sync::{Arc, PoisonError, RwLock};
use std::time::Duration;
use log::{debug, error, info};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};

use crate::config::MqttConfig;

#[derive(Debug, Clone, PartialEq)]
pub enum MqttConnectionStatus {
    Connected,
    Disconnected,
    Error(String),
}

/// Publishes the JSON report of every update below `<topic_prefix>/<meter name>`.
pub struct MqttPublisher {
    client: AsyncClient,
    topic_prefix: String,
    status: Arc<RwLock<MqttConnectionStatus>>,
}

fn set_status(status: &RwLock<MqttConnectionStatus>, new_status: MqttConnectionStatus) {
    *status.write().unwrap_or_else(PoisonError::into_inner) = new_status;
}

/// Meter names end up in the topic, MQTT wildcards and levels are not allowed there.
pub fn topic_for(prefix: &str, meter: &str) -> String {
    let name: String = meter.chars().map(|c| if matches!(c, '/' | '+' | '#') { '_' } else { c }).collect();
    format!("{}/{}", prefix.trim_end_matches('/'), name)
}

impl MqttPublisher {
    /// Must be called from within the tokio runtime, the event loop runs in its own task.
    pub fn new(config: &MqttConfig) -> Self {
        info!("MQTT connection to {}:{} starting up", config.host, config.port);
        let mut mqttoptions = MqttOptions::new(config.client_name.clone(), config.host.clone(), config.port);
        mqttoptions.set_keep_alive(Duration::from_secs(5));
        if !config.user.is_empty() {
            mqttoptions.set_credentials(config.user.clone(), config.pass.clone());
        }

        let (client, mut eventloop) = AsyncClient::new(mqttoptions, 10);
        let status = Arc::new(RwLock::new(MqttConnectionStatus::Disconnected));

        let loop_status = status.clone();
        tokio::spawn(async move {
            info!("MQTT Eventloop started");
            loop {
                match eventloop.poll().await {
                    Ok(Event::Incoming(Packet::ConnAck(_))) => {
                        info!("MQTT connected");
                        set_status(&loop_status, MqttConnectionStatus::Connected);
                    }
                    Ok(_) => {}
                    Err(e) => {
                        error!("Error in MQTT {e:?}, reconnecting");
                        set_status(&loop_status, MqttConnectionStatus::Error(e.to_string()));
                        tokio::time::sleep(Duration::from_secs(1)).await;
                    }
                }
            }
        });

        MqttPublisher {
            client,
            topic_prefix: config.topic_prefix.clone(),
            status,
        }
    }

    pub fn status(&self) -> MqttConnectionStatus {
        self.status.read().unwrap_or_else(PoisonError::into_inner).clone()
    }

    pub fn topic(&self, meter: &str) -> String {
        topic_for(&self.topic_prefix, meter)
    }

    /// Failures are logged, the meter never hears about them.
    pub async fn publish(&self, meter: &str, json: String) {
        let topic = self.topic(meter);
        match self.client.publish(topic.clone(), QoS::AtLeastOnce, false, json).await {
            Err(e) => error!("Error publishing to {topic}: {e}"),
            Ok(_) => debug!("Published to {topic}"),
        }
    }
}
