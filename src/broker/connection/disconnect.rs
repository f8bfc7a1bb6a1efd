//! Connection teardown and will message publishing

use std::mem;
use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncWrite};
use tracing::{debug, info};

use super::{Connection, Exit, State};
use crate::protocol::{Publish, Will};

impl<S> Connection<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Unregister the client and publish its will if the session ended abruptly
    pub(crate) fn handle_disconnect(&mut self, exit: Exit) {
        let State::Connected { client_id, will } = mem::replace(&mut self.state, State::Connecting)
        else {
            return;
        };

        // After a takeover the entry belongs to the new connection
        let conn_id = self.conn_id;
        let removed = self
            .router
            .connections
            .remove_if(&client_id, |_, handle| handle.conn_id == conn_id)
            .is_some();
        if removed {
            self.router.subscriptions.unsubscribe_all(&client_id);
        }

        if let Some(ref metrics) = self.metrics {
            metrics.client_disconnected();
        }

        if exit.publishes_will() {
            if let Some(will) = will {
                self.publish_will(&client_id, will);
            }
        }

        info!("Client {} disconnected ({:?})", client_id, exit);
    }

    fn publish_will(&self, client_id: &Arc<str>, will: Will) {
        debug!("Publishing will for {} to {}", client_id, will.topic);
        let mut publish = Publish::new(will.topic, will.payload, will.qos);
        publish.retain = will.retain;
        self.router.route(&publish);
    }
}
