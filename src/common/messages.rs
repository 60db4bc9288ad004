//! Wire messages: a closed set of request/response kinds with a bencode
//! encoding and a compact node representation.

use std::convert::TryFrom;

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;

use crate::common::{Id, InvalidIdSize, Node, ID_SIZE};

/// Bytes per node in the compact encoding: 20 id + 4 ip + 2 port.
const COMPACT_NODE_SIZE: usize = ID_SIZE + 6;

#[derive(Debug, Clone, PartialEq)]
pub struct Message {
    pub transaction_id: u16,
    pub version: Option<[u8; 4]>,
    pub message_type: MessageType,
}

#[derive(Debug, Clone, PartialEq)]
pub enum MessageType {
    Request(RequestSpecific),
    Response(ResponseSpecific),
    Error(ErrorSpecific),
}

#[derive(Debug, Clone, PartialEq)]
pub struct RequestSpecific {
    pub requester_id: Id,
    pub request_type: RequestTypeSpecific,
}

#[derive(Debug, Clone, PartialEq)]
pub enum RequestTypeSpecific {
    Ping,
    FindNode(FindNodeRequestArguments),
    FindValue(FindValueRequestArguments),
    Store(StoreRequestArguments),
}

#[derive(Debug, Clone, PartialEq)]
pub struct FindNodeRequestArguments {
    pub target: Id,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FindValueRequestArguments {
    pub key: Id,
}

#[derive(Debug, Clone, PartialEq)]
pub struct StoreRequestArguments {
    pub key: Id,
    pub owner: Id,
    pub value: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ResponseSpecific {
    /// Reply to PING, and the acknowledgement of a STORE.
    Pong(PongResponseArguments),
    /// Reply to FIND_NODE, and to a FIND_VALUE miss.
    FindNode(FindNodeResponseArguments),
    /// Reply to a FIND_VALUE hit.
    FindValue(FindValueResponseArguments),
}

#[derive(Debug, Clone, PartialEq)]
pub struct PongResponseArguments {
    pub responder_id: Id,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FindNodeResponseArguments {
    pub responder_id: Id,
    pub nodes: Vec<Node>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct FindValueResponseArguments {
    pub responder_id: Id,
    pub value: Bytes,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ErrorSpecific {
    pub code: i32,
    pub description: String,
}

impl Message {
    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_bencode::Error> {
        serde_bencode::to_bytes(&WireMessage::from(self))
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Message, DecodeMessageError> {
        let wire: WireMessage = serde_bencode::from_bytes(bytes)?;
        Message::try_from(wire)
    }

    /// The id of whoever authored this message, if it carries one.
    pub fn get_author_id(&self) -> Option<Id> {
        match &self.message_type {
            MessageType::Request(request) => Some(request.requester_id),
            MessageType::Response(response) => Some(match response {
                ResponseSpecific::Pong(arguments) => arguments.responder_id,
                ResponseSpecific::FindNode(arguments) => arguments.responder_id,
                ResponseSpecific::FindValue(arguments) => arguments.responder_id,
            }),
            MessageType::Error(_) => None,
        }
    }

    /// Closer nodes revealed by a response, if any.
    pub fn get_closer_nodes(&self) -> Option<&[Node]> {
        match &self.message_type {
            MessageType::Response(ResponseSpecific::FindNode(arguments)) => {
                Some(&arguments.nodes)
            }
            _ => None,
        }
    }
}

// === Wire representation ===

#[derive(Serialize, Deserialize, Debug)]
struct WireMessage {
    #[serde(rename = "t", with = "serde_bytes")]
    transaction_id: Vec<u8>,

    #[serde(default)]
    #[serde(rename = "v", with = "serde_bytes")]
    version: Option<Vec<u8>>,

    #[serde(flatten)]
    variant: WireMessageVariant,
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "y")]
enum WireMessageVariant {
    #[serde(rename = "q")]
    Request(WireRequestSpecific),

    #[serde(rename = "r")]
    Response(WireResponseSpecific),

    #[serde(rename = "e")]
    Error(WireErrorSpecific),
}

#[derive(Serialize, Deserialize, Debug)]
#[serde(tag = "q")]
enum WireRequestSpecific {
    #[serde(rename = "ping")]
    Ping {
        #[serde(rename = "a")]
        arguments: WirePingRequestArguments,
    },

    #[serde(rename = "find_node")]
    FindNode {
        #[serde(rename = "a")]
        arguments: WireFindNodeRequestArguments,
    },

    #[serde(rename = "find_value")]
    FindValue {
        #[serde(rename = "a")]
        arguments: WireFindValueRequestArguments,
    },

    #[serde(rename = "store")]
    Store {
        #[serde(rename = "a")]
        arguments: WireStoreRequestArguments,
    },
}

// This means order matters! Order these from most to least detailed.
#[derive(Serialize, Deserialize, Debug)]
#[serde(untagged)]
enum WireResponseSpecific {
    FindValue {
        #[serde(rename = "r")]
        arguments: WireFindValueResponseArguments,
    },

    FindNode {
        #[serde(rename = "r")]
        arguments: WireFindNodeResponseArguments,
    },

    Pong {
        #[serde(rename = "r")]
        arguments: WirePongResponseArguments,
    },
}

#[derive(Serialize, Deserialize, Debug)]
struct WireErrorSpecific {
    #[serde(rename = "e")]
    error_info: (i32, String),
}

#[derive(Serialize, Deserialize, Debug)]
struct WirePingRequestArguments {
    #[serde(with = "serde_bytes")]
    id: [u8; ID_SIZE],
}

#[derive(Serialize, Deserialize, Debug)]
struct WireFindNodeRequestArguments {
    #[serde(with = "serde_bytes")]
    id: [u8; ID_SIZE],

    #[serde(with = "serde_bytes")]
    target: [u8; ID_SIZE],
}

#[derive(Serialize, Deserialize, Debug)]
struct WireFindValueRequestArguments {
    #[serde(with = "serde_bytes")]
    id: [u8; ID_SIZE],

    #[serde(with = "serde_bytes")]
    key: [u8; ID_SIZE],
}

#[derive(Serialize, Deserialize, Debug)]
struct WireStoreRequestArguments {
    #[serde(with = "serde_bytes")]
    id: [u8; ID_SIZE],

    #[serde(with = "serde_bytes")]
    key: [u8; ID_SIZE],

    #[serde(with = "serde_bytes")]
    owner: [u8; ID_SIZE],

    #[serde(rename = "v")]
    value: ByteBuf,
}

#[derive(Serialize, Deserialize, Debug)]
struct WirePongResponseArguments {
    #[serde(with = "serde_bytes")]
    id: [u8; ID_SIZE],
}

#[derive(Serialize, Deserialize, Debug)]
struct WireFindNodeResponseArguments {
    #[serde(with = "serde_bytes")]
    id: [u8; ID_SIZE],

    nodes: ByteBuf,
}

#[derive(Serialize, Deserialize, Debug)]
struct WireFindValueResponseArguments {
    #[serde(with = "serde_bytes")]
    id: [u8; ID_SIZE],

    #[serde(rename = "v")]
    value: ByteBuf,
}

impl From<&Message> for WireMessage {
    fn from(message: &Message) -> WireMessage {
        WireMessage {
            transaction_id: message.transaction_id.to_be_bytes().to_vec(),
            version: message.version.map(|version| version.to_vec()),
            variant: match &message.message_type {
                MessageType::Request(request) => {
                    let id = *request.requester_id.as_bytes();

                    WireMessageVariant::Request(match &request.request_type {
                        RequestTypeSpecific::Ping => WireRequestSpecific::Ping {
                            arguments: WirePingRequestArguments { id },
                        },
                        RequestTypeSpecific::FindNode(arguments) => WireRequestSpecific::FindNode {
                            arguments: WireFindNodeRequestArguments {
                                id,
                                target: *arguments.target.as_bytes(),
                            },
                        },
                        RequestTypeSpecific::FindValue(arguments) => {
                            WireRequestSpecific::FindValue {
                                arguments: WireFindValueRequestArguments {
                                    id,
                                    key: *arguments.key.as_bytes(),
                                },
                            }
                        }
                        RequestTypeSpecific::Store(arguments) => WireRequestSpecific::Store {
                            arguments: WireStoreRequestArguments {
                                id,
                                key: *arguments.key.as_bytes(),
                                owner: *arguments.owner.as_bytes(),
                                value: ByteBuf::from(arguments.value.to_vec()),
                            },
                        },
                    })
                }
                MessageType::Response(response) => {
                    WireMessageVariant::Response(match response {
                        ResponseSpecific::Pong(arguments) => WireResponseSpecific::Pong {
                            arguments: WirePongResponseArguments {
                                id: *arguments.responder_id.as_bytes(),
                            },
                        },
                        ResponseSpecific::FindNode(arguments) => WireResponseSpecific::FindNode {
                            arguments: WireFindNodeResponseArguments {
                                id: *arguments.responder_id.as_bytes(),
                                nodes: ByteBuf::from(nodes_to_bytes(&arguments.nodes)),
                            },
                        },
                        ResponseSpecific::FindValue(arguments) => WireResponseSpecific::FindValue {
                            arguments: WireFindValueResponseArguments {
                                id: *arguments.responder_id.as_bytes(),
                                value: ByteBuf::from(arguments.value.to_vec()),
                            },
                        },
                    })
                }
                MessageType::Error(error) => WireMessageVariant::Error(WireErrorSpecific {
                    error_info: (error.code, error.description.clone()),
                }),
            },
        }
    }
}

impl TryFrom<WireMessage> for Message {
    type Error = DecodeMessageError;

    fn try_from(wire: WireMessage) -> Result<Message, DecodeMessageError> {
        let transaction_id = match wire.transaction_id.len() {
            2 => u16::from_be_bytes([wire.transaction_id[0], wire.transaction_id[1]]),
            _ => return Err(DecodeMessageError::InvalidTransactionId(wire.transaction_id)),
        };

        let message_type = match wire.variant {
            WireMessageVariant::Request(request) => MessageType::Request(match request {
                WireRequestSpecific::Ping { arguments } => RequestSpecific {
                    requester_id: Id::from(arguments.id),
                    request_type: RequestTypeSpecific::Ping,
                },
                WireRequestSpecific::FindNode { arguments } => RequestSpecific {
                    requester_id: Id::from(arguments.id),
                    request_type: RequestTypeSpecific::FindNode(FindNodeRequestArguments {
                        target: Id::from(arguments.target),
                    }),
                },
                WireRequestSpecific::FindValue { arguments } => RequestSpecific {
                    requester_id: Id::from(arguments.id),
                    request_type: RequestTypeSpecific::FindValue(FindValueRequestArguments {
                        key: Id::from(arguments.key),
                    }),
                },
                WireRequestSpecific::Store { arguments } => RequestSpecific {
                    requester_id: Id::from(arguments.id),
                    request_type: RequestTypeSpecific::Store(StoreRequestArguments {
                        key: Id::from(arguments.key),
                        owner: Id::from(arguments.owner),
                        value: Bytes::from(arguments.value.into_vec()),
                    }),
                },
            }),
            WireMessageVariant::Response(response) => MessageType::Response(match response {
                WireResponseSpecific::Pong { arguments } => {
                    ResponseSpecific::Pong(PongResponseArguments {
                        responder_id: Id::from(arguments.id),
                    })
                }
                WireResponseSpecific::FindNode { arguments } => {
                    ResponseSpecific::FindNode(FindNodeResponseArguments {
                        responder_id: Id::from(arguments.id),
                        nodes: nodes_from_bytes(&arguments.nodes)?,
                    })
                }
                WireResponseSpecific::FindValue { arguments } => {
                    ResponseSpecific::FindValue(FindValueResponseArguments {
                        responder_id: Id::from(arguments.id),
                        value: Bytes::from(arguments.value.into_vec()),
                    })
                }
            }),
            WireMessageVariant::Error(error) => MessageType::Error(ErrorSpecific {
                code: error.error_info.0,
                description: error.error_info.1,
            }),
        };

        Ok(Message {
            transaction_id,
            // Versions of unexpected size are advisory only, drop them.
            version: wire
                .version
                .and_then(|version| <[u8; 4]>::try_from(version.as_slice()).ok()),
            message_type,
        })
    }
}

fn nodes_to_bytes(nodes: &[Node]) -> Vec<u8> {
    let mut bytes = Vec::with_capacity(nodes.len() * COMPACT_NODE_SIZE);

    for node in nodes {
        bytes.extend_from_slice(node.id().as_bytes());
        bytes.extend_from_slice(&node.address().ip().octets());
        bytes.extend_from_slice(&node.address().port().to_be_bytes());
    }

    bytes
}

fn nodes_from_bytes(bytes: &[u8]) -> Result<Vec<Node>, DecodeMessageError> {
    if bytes.len() % COMPACT_NODE_SIZE != 0 {
        return Err(DecodeMessageError::InvalidNodesEncoding(bytes.len()));
    }

    let mut nodes = Vec::with_capacity(bytes.len() / COMPACT_NODE_SIZE);

    for chunk in bytes.chunks_exact(COMPACT_NODE_SIZE) {
        let id = Id::from_bytes(&chunk[..ID_SIZE])?;
        let ip: [u8; 4] = [
            chunk[ID_SIZE],
            chunk[ID_SIZE + 1],
            chunk[ID_SIZE + 2],
            chunk[ID_SIZE + 3],
        ];
        let port = u16::from_be_bytes([chunk[ID_SIZE + 4], chunk[ID_SIZE + 5]]);

        nodes.push(Node::new(
            id,
            std::net::SocketAddrV4::new(ip.into(), port),
        ));
    }

    Ok(nodes)
}

#[derive(thiserror::Error, Debug)]
pub enum DecodeMessageError {
    #[error("Failed to parse packet bytes: {0}")]
    Bencode(#[from] serde_bencode::Error),

    #[error("Invalid transaction_id: {0:?}")]
    InvalidTransactionId(Vec<u8>),

    #[error("Compact node encoding has invalid length: {0}")]
    InvalidNodesEncoding(usize),

    #[error(transparent)]
    InvalidIdSize(#[from] InvalidIdSize),
}

#[cfg(test)]
mod test {
    use super::*;

    fn roundtrip(message: Message) {
        let bytes = message.to_bytes().expect("encodes");
        let decoded = Message::from_bytes(&bytes).expect("decodes");

        assert_eq!(decoded, message);
    }

    #[test]
    fn ping_request() {
        roundtrip(Message {
            transaction_id: 21,
            version: None,
            message_type: MessageType::Request(RequestSpecific {
                requester_id: Id::random(),
                request_type: RequestTypeSpecific::Ping,
            }),
        });
    }

    #[test]
    fn find_node_roundtrip() {
        roundtrip(Message {
            transaction_id: 1,
            version: Some([107, 97, 0, 1]),
            message_type: MessageType::Request(RequestSpecific {
                requester_id: Id::random(),
                request_type: RequestTypeSpecific::FindNode(FindNodeRequestArguments {
                    target: Id::random(),
                }),
            }),
        });

        roundtrip(Message {
            transaction_id: 2,
            version: None,
            message_type: MessageType::Response(ResponseSpecific::FindNode(
                FindNodeResponseArguments {
                    responder_id: Id::random(),
                    nodes: vec![
                        Node::new(Id::random(), "203.0.113.10:6881".parse().expect("valid")),
                        Node::new(Id::random(), "203.0.113.11:4242".parse().expect("valid")),
                    ],
                },
            )),
        });
    }

    #[test]
    fn store_and_value_roundtrip() {
        roundtrip(Message {
            transaction_id: 3,
            version: None,
            message_type: MessageType::Request(RequestSpecific {
                requester_id: Id::random(),
                request_type: RequestTypeSpecific::Store(StoreRequestArguments {
                    key: Id::hash(b"payload"),
                    owner: Id::random(),
                    value: Bytes::from_static(b"payload"),
                }),
            }),
        });

        roundtrip(Message {
            transaction_id: 4,
            version: None,
            message_type: MessageType::Response(ResponseSpecific::FindValue(
                FindValueResponseArguments {
                    responder_id: Id::random(),
                    value: Bytes::from_static(b"payload"),
                },
            )),
        });
    }

    #[test]
    fn error_roundtrip() {
        roundtrip(Message {
            transaction_id: 5,
            version: None,
            message_type: MessageType::Error(ErrorSpecific {
                code: 203,
                description: "Protocol Error".to_string(),
            }),
        });
    }

    #[test]
    fn empty_nodes_roundtrip() {
        roundtrip(Message {
            transaction_id: 6,
            version: None,
            message_type: MessageType::Response(ResponseSpecific::FindNode(
                FindNodeResponseArguments {
                    responder_id: Id::random(),
                    nodes: vec![],
                },
            )),
        });
    }

    #[test]
    fn malformed_bytes_are_rejected() {
        assert!(Message::from_bytes(b"not bencode at all").is_err());
        assert!(Message::from_bytes(b"").is_err());
    }

    #[test]
    fn author_id_and_closer_nodes() {
        let responder_id = Id::random();
        let message = Message {
            transaction_id: 7,
            version: None,
            message_type: MessageType::Response(ResponseSpecific::FindNode(
                FindNodeResponseArguments {
                    responder_id,
                    nodes: vec![Node::new(Id::random(), "127.0.0.1:2030".parse().expect("valid"))],
                },
            )),
        };

        assert_eq!(message.get_author_id(), Some(responder_id));
        assert_eq!(message.get_closer_nodes().map(<[Node]>::len), Some(1));
    }
}
