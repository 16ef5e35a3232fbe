// Data-Operation Proxying (§4.6): the controller never executes a
// `DataOperation` itself, it forwards to the first connected Query
// peer it finds and relays the answer.

use std::sync::Arc;

use crate::message::{DataOperationStatus, Payload};
use crate::node::ControllerNode;
use crate::types::NodeType;

pub fn proxy_data_operation(node: &Arc<ControllerNode>, body: Vec<u8>) -> Payload {
    let Some(query_peer) = node.first_of_type(NodeType::Query) else {
        return Payload::DataOperationResult {
            status: DataOperationStatus::FailedMessage,
            detail: "Could not reach a query node.".to_string(),
        };
    };

    let handle = match node.transport.send_message(&query_peer, Payload::DataOperation { body }, true) {
        Ok(handle) => handle,
        Err(_) => {
            return Payload::DataOperationResult {
                status: DataOperationStatus::FailedMessage,
                detail: "Could not reach a query node.".to_string(),
            }
        }
    };

    let outcome = handle.block_until_done();
    if !outcome.success {
        return Payload::DataOperationResult {
            status: DataOperationStatus::FailedMessage,
            detail: "Could not reach a query node.".to_string(),
        };
    }
    match outcome.response {
        Some(env) => env.payload,
        None => Payload::DataOperationResult {
            status: DataOperationStatus::FailedMessage,
            detail: "Could not reach a query node.".to_string(),
        },
    }
}
