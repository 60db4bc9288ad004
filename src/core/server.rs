//! Answering requests from other nodes.

use bytes::Bytes;
use tracing::debug;

use crate::common::messages::{
    ErrorSpecific, FindNodeResponseArguments, FindValueResponseArguments, PongResponseArguments,
    RequestSpecific, RequestTypeSpecific, ResponseSpecific,
};
use crate::common::{Id, RoutingTable};
use crate::core::storage::ContentStore;

/// Maximum accepted value payload in bytes.
pub const MAX_VALUE_SIZE: usize = 1000;

pub const ERROR_PROTOCOL: i32 = 203;
pub const ERROR_VALUE_TOO_LARGE: i32 = 205;

/// Compute the response to a single inbound request.
pub fn handle_request(
    local_id: &Id,
    routing_table: &RoutingTable,
    store: &mut ContentStore,
    request: &RequestSpecific,
) -> Result<ResponseSpecific, ErrorSpecific> {
    let responder_id = *local_id;

    match &request.request_type {
        RequestTypeSpecific::Ping => {
            Ok(ResponseSpecific::Pong(PongResponseArguments { responder_id }))
        }
        RequestTypeSpecific::FindNode(arguments) => {
            Ok(ResponseSpecific::FindNode(FindNodeResponseArguments {
                responder_id,
                nodes: routing_table.closest(&arguments.target),
            }))
        }
        RequestTypeSpecific::FindValue(arguments) => match store.get(&arguments.key) {
            Some(entry) => Ok(ResponseSpecific::FindValue(FindValueResponseArguments {
                responder_id,
                value: entry.value().clone(),
            })),
            // A miss degrades to the FIND_NODE answer so the lookup can
            // keep converging.
            None => Ok(ResponseSpecific::FindNode(FindNodeResponseArguments {
                responder_id,
                nodes: routing_table.closest(&arguments.key),
            })),
        },
        RequestTypeSpecific::Store(arguments) => {
            validate_store(&arguments.key, &arguments.value)?;

            store.put(arguments.key, arguments.value.clone(), arguments.owner);

            Ok(ResponseSpecific::Pong(PongResponseArguments { responder_id }))
        }
    }
}

fn validate_store(key: &Id, value: &Bytes) -> Result<(), ErrorSpecific> {
    if value.len() > MAX_VALUE_SIZE {
        debug!(?key, size = value.len(), "Rejecting oversized value");

        return Err(ErrorSpecific {
            code: ERROR_VALUE_TOO_LARGE,
            description: "Value too large".to_string(),
        });
    }

    if Id::hash(value) != *key {
        debug!(?key, "Rejecting value whose hash does not match its key");

        return Err(ErrorSpecific {
            code: ERROR_PROTOCOL,
            description: "Key does not match the value hash".to_string(),
        });
    }

    Ok(())
}
