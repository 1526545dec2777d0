use crate::domain::{paging_from_query_params, CommandCatalog, QueryTarget};
use common::domain::{
    DeviceCoreCommandResponse, DomainError, DomainResult, MessageEnvelope,
    MultiDeviceCoreCommandsResponse, CONTENT_TYPE_JSON,
};
use serde::Serialize;
use std::sync::Arc;
use tracing::{debug, error, instrument};

/// Answers "list available commands" requests
pub struct CommandQueryDispatcher {
    catalog: Arc<CommandCatalog>,
}

impl CommandQueryDispatcher {
    pub fn new(catalog: Arc<CommandCatalog>) -> Self {
        Self { catalog }
    }

    /// Build the response to a command query.
    ///
    /// Returns `None` only when the request carries no RequestID; every other
    /// failure is answered with an error envelope.
    #[instrument(
        name = "dispatch_query",
        skip_all,
        fields(request_id = %envelope.request_id, correlation_id = %envelope.correlation_id)
    )]
    pub async fn handle_query(
        &self,
        envelope: &MessageEnvelope,
        target: QueryTarget,
    ) -> Option<MessageEnvelope> {
        if !envelope.has_request_id() {
            error!(error = %DomainError::MissingRequestId, "dropping command query");
            return None;
        }

        let response = match self.query_payload(envelope, &target).await {
            Ok(payload) => MessageEnvelope::for_response(
                payload,
                &envelope.request_id,
                &envelope.correlation_id,
                CONTENT_TYPE_JSON,
            ),
            Err(e) => {
                let message = failure_message(&target, &e);
                error!(error = %message, "command query failed");
                MessageEnvelope::with_error(&envelope.request_id, &envelope.correlation_id, message)
            }
        };
        Some(response)
    }

    async fn query_payload(
        &self,
        envelope: &MessageEnvelope,
        target: &QueryTarget,
    ) -> DomainResult<Vec<u8>> {
        match target {
            QueryTarget::AllDevices => {
                let (offset, limit) = paging_from_query_params(&envelope.query_params)?;
                debug!(offset, limit, "listing commands of all devices");

                let (commands, total_count) = self.catalog.all_commands(offset, limit).await?;
                to_json(&MultiDeviceCoreCommandsResponse::ok(total_count, commands))
            }
            QueryTarget::Device(device_name) => {
                debug!(device_name = %device_name, "listing commands of device");

                let commands = self.catalog.commands_by_device_name(device_name).await?;
                to_json(&DeviceCoreCommandResponse::ok(commands))
            }
        }
    }
}

/// Error envelope text; registry failures are prefixed with the query that failed
fn failure_message(target: &QueryTarget, err: &DomainError) -> String {
    match (target, err) {
        (_, DomainError::InvalidPagination(_) | DomainError::Serialization(_)) => err.to_string(),
        (QueryTarget::AllDevices, _) => format!("failed to get all commands: {}", err),
        (QueryTarget::Device(device_name), _) => {
            format!("failed to get commands by device name '{}': {}", device_name, err)
        }
    }
}

fn to_json<T: Serialize>(value: &T) -> DomainResult<Vec<u8>> {
    serde_json::to_vec(value).map_err(|e| {
        DomainError::Serialization(format!("failed to encode core commands payload: {}", e))
    })
}
