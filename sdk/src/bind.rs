//! Binding handle - the lifetime of one subscription
use crate::error::{OpError, OpResult};
use crate::path::ThingPath;
use crate::transport::{Transport, TransportExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, warn};

/// Handle on an active subscription
///
/// Dropping the handle does not unsubscribe; call [`ThingBind::unbind`].
pub struct ThingBind {
    path: ThingPath,
    action: &'static str,
    express: String,
    transport: Arc<dyn Transport>,

    // Shared with the dispatcher, which drops messages once this is cleared
    active: Arc<AtomicBool>,
}

impl ThingBind {
    pub(crate) fn new(path: ThingPath, action: &'static str, express: &str,
                      transport: Arc<dyn Transport>, active: Arc<AtomicBool>) -> Self {
        Self {
            path,
            action,
            express: express.to_string(),
            transport,
            active,
        }
    }

    /// Topic filter this bind is subscribed to
    pub fn express(&self) -> &str {
        &self.express
    }

    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }

    /// Unsubscribe and stop dispatching
    ///
    /// Only the first call reaches the transport; later calls succeed without
    /// doing anything.
    pub async fn unbind(&self) -> OpResult<()> {
        if !self.active.swap(false, Ordering::AcqRel) {
            debug!("{}/op/{}/unbind already done; express={};", self.path, self.action, self.express);
            return Ok(());
        }

        match self.transport.unsubscribe_async(&self.express).await {
            Ok(()) => {
                debug!("{}/op/{}/unbind success; express={};", self.path, self.action, self.express);
                Ok(())
            }
            Err(e) => {
                warn!("{}/op/{}/unbind failure; express={}; {e:#}", self.path, self.action, self.express);
                Err(OpError::transport("unsubscribe", &self.express, e))
            }
        }
    }
}
