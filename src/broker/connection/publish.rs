//! PUBLISH handling and the acknowledgement flows

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, trace, warn};

use super::{violation, Connection, ConnectionError};
use crate::protocol::{Packet, PubAck, PubComp, PubRec, PubRel, Publish, QoS};
use crate::topic::validate_topic_name;

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Handle an inbound PUBLISH
    pub(crate) async fn handle_publish(&mut self, publish: Publish) -> Result<(), ConnectionError> {
        if let Err(reason) = validate_topic_name(&publish.topic) {
            warn!("Invalid topic name from {}: {}", self.addr, reason);
            return Err(violation("invalid topic name in PUBLISH"));
        }

        trace!(
            "PUBLISH from {} on {} ({:?}, {} bytes)",
            self.addr,
            publish.topic,
            publish.qos,
            publish.payload.len()
        );
        if let Some(ref metrics) = self.metrics {
            metrics.publish_received();
        }

        match (publish.qos, publish.packet_id) {
            (QoS::AtMostOnce, _) => {
                self.router.route(&publish);
            }
            (QoS::AtLeastOnce, Some(packet_id)) => {
                self.router.route(&publish);
                self.write_packet(&Packet::PubAck(PubAck::new(packet_id)))
                    .await?;
            }
            (QoS::ExactlyOnce, Some(packet_id)) => {
                // Route on first receipt only; a DUP resend just gets another PUBREC
                if self.awaiting_rel.insert(packet_id) {
                    self.router.route(&publish);
                } else {
                    debug!("Duplicate QoS 2 PUBLISH {} from {}", packet_id, self.addr);
                }
                self.write_packet(&Packet::PubRec(PubRec::new(packet_id)))
                    .await?;
            }
            (_, None) => return Err(violation("missing packet id")),
        }

        Ok(())
    }

    /// Complete an inbound QoS 2 exchange
    pub(crate) async fn handle_pubrel(&mut self, pubrel: PubRel) -> Result<(), ConnectionError> {
        if !self.awaiting_rel.remove(&pubrel.packet_id) {
            debug!(
                "PUBREL for unknown packet id {} from {}",
                pubrel.packet_id, self.addr
            );
        }
        // PUBCOMP is sent either way so the client can release the id
        self.write_packet(&Packet::PubComp(PubComp::new(pubrel.packet_id)))
            .await
    }

    /// Deliver a routed message to this client.
    ///
    /// QoS 1 messages get a fresh packet id and are tracked until PUBACK.
    /// Nothing is redelivered.
    pub(crate) async fn send_publish(&mut self, mut publish: Publish) -> Result<(), ConnectionError> {
        if publish.qos > QoS::AtMostOnce {
            let packet_id = self.allocate_packet_id();
            self.inflight.insert(packet_id);
            publish.packet_id = Some(packet_id);
        } else {
            publish.packet_id = None;
        }

        self.write_packet(&Packet::Publish(publish)).await?;
        if let Some(ref metrics) = self.metrics {
            metrics.publish_sent();
        }
        Ok(())
    }

    /// Next non-zero packet id not awaiting acknowledgement
    fn allocate_packet_id(&mut self) -> u16 {
        loop {
            let id = self.next_packet_id;
            self.next_packet_id = self.next_packet_id.checked_add(1).unwrap_or(1);
            // With every id in flight the oldest is reused
            if !self.inflight.contains(&id) || self.inflight.len() >= u16::MAX as usize {
                return id;
            }
        }
    }
}
