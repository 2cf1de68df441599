use async_trait::async_trait;
use tracing::debug;

use crate::channel::ManagementChannel;
use crate::dispatcher::RequestHandler;
use crate::envelope::{Envelope, ResponseCode};
use crate::error::Result;

/// Acknowledges generic requests.
#[derive(Debug, Default)]
pub struct GenericHandler;

#[async_trait]
impl RequestHandler for GenericHandler {
    fn channel(&self) -> ManagementChannel {
        ManagementChannel::Generic
    }

    async fn handle(&self, channel: &str, request: Envelope) -> Result<Option<Envelope>> {
        debug!(channel, req_id = ?request.request_id, "generic request acknowledged");
        Ok(Some(Envelope::response_to(&request, ResponseCode::Success)))
    }
}
