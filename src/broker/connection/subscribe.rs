//! SUBSCRIBE and UNSUBSCRIBE packet handling

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::debug;

use super::{violation, Connection, ConnectionError};
use crate::protocol::{
    Packet, QoS, SubAck, Subscribe, SubscribeReturnCode, UnsubAck, Unsubscribe,
};
use crate::topic::{validate_topic_filter, Subscription};

/// Highest QoS granted on a subscription
const MAX_GRANTED_QOS: QoS = QoS::AtLeastOnce;

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Handle SUBSCRIBE packet
    pub(crate) async fn handle_subscribe(
        &mut self,
        subscribe: Subscribe,
    ) -> Result<(), ConnectionError> {
        let client_id = self
            .client_id()
            .cloned()
            .ok_or_else(|| violation("SUBSCRIBE before CONNECT"))?;

        let mut return_codes = Vec::with_capacity(subscribe.subscriptions.len());
        let mut granted = Vec::with_capacity(subscribe.subscriptions.len());

        for sub in &subscribe.subscriptions {
            if let Err(reason) = validate_topic_filter(&sub.filter) {
                debug!(
                    "Refusing filter '{}' from {}: {}",
                    sub.filter, client_id, reason
                );
                return_codes.push(SubscribeReturnCode::Failure);
                continue;
            }

            let qos = sub.qos.min(MAX_GRANTED_QOS);
            self.router.subscriptions.subscribe(
                &sub.filter,
                Subscription {
                    client_id: client_id.clone(),
                    qos,
                },
            );
            debug!("{} subscribed to {} ({:?})", client_id, sub.filter, qos);
            return_codes.push(SubscribeReturnCode::Success(qos));
            granted.push((sub.filter.as_str(), qos));
        }

        // Retained messages must follow the SUBACK
        let retained: Vec<_> = granted
            .iter()
            .flat_map(|(filter, qos)| {
                self.router
                    .retained_matching(filter)
                    .into_iter()
                    .map(move |mut publish| {
                        publish.qos = publish.qos.min(*qos);
                        publish
                    })
            })
            .collect();

        self.write_packet(&Packet::SubAck(SubAck {
            packet_id: subscribe.packet_id,
            return_codes,
        }))
        .await?;

        for publish in retained {
            self.send_publish(publish).await?;
        }

        Ok(())
    }

    /// Handle UNSUBSCRIBE packet
    pub(crate) async fn handle_unsubscribe(
        &mut self,
        unsubscribe: Unsubscribe,
    ) -> Result<(), ConnectionError> {
        let client_id = self
            .client_id()
            .cloned()
            .ok_or_else(|| violation("UNSUBSCRIBE before CONNECT"))?;

        for filter in &unsubscribe.filters {
            if self.router.subscriptions.unsubscribe(filter, &client_id) {
                debug!("{} unsubscribed from {}", client_id, filter);
            }
        }

        self.write_packet(&Packet::UnsubAck(UnsubAck::new(unsubscribe.packet_id)))
            .await
    }
}
