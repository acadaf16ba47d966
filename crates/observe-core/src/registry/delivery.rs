//! Delivery loop: one task per session reading datagrams in arrival order.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::task::JoinHandle;
use tracing::{debug, warn};

use super::ObservationRegistry;
use crate::domain::{NotificationError, SessionError};
use crate::ports::DatagramTransport;

/// Spawn the delivery loop for `registry`'s session.
///
/// The loop ends when the session is closed or lost. Per-datagram failures
/// are logged and never stop it.
pub fn spawn_delivery<T: DatagramTransport>(registry: Arc<ObservationRegistry<T>>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let transport = Arc::clone(registry.transport());
        loop {
            let datagram = match transport.recv().await {
                Ok(datagram) => datagram,
                Err(SessionError::Closed) => {
                    debug!("Delivery loop stopped: session closed");
                    break;
                }
                Err(e) => {
                    warn!(error = %e, "Delivery loop stopped");
                    break;
                }
            };

            if let Err(e) = registry.handle_datagram(datagram).await {
                registry.stats().dropped.fetch_add(1, Ordering::Relaxed);
                match e {
                    NotificationError::Malformed(_) => warn!(error = %e, "Dropped datagram"),
                    _ => debug!(error = %e, "Dropped notification"),
                }
            }
        }
    })
}
