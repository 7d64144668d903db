//! The telefab wire protocol.
//!
//! The transport delivers length-framed byte sequences; each sequence is
//! `frame_type:u8 || payload` (the length word itself belongs to the
//! transport driver). This module turns those sequences into typed
//! [Frame]s and back.

use crate::codec::{
    self, read_u16_le, read_u32_le, read_u64_le, read_u8, take,
};
use crate::store::{Command, Entry, Event, Query, QueryReply};
use crate::{
    EndpointId, ErrorCode, FabError, FabResult, Filter, Timestamp, Topic,
    Value,
};
use bytes::{BufMut, Bytes, BytesMut};

/// The protocol version sent in HELLO. Peers with a different version
/// are rejected during the handshake.
pub const PROTOCOL_VERSION: u32 = 1;

/// Wire frame type bytes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameType {
    /// Handshake opener.
    Hello = 1,
    /// Handshake acknowledgement.
    HelloAck = 2,
    /// Graceful unpeer.
    Goodbye = 3,
    /// Keep-alive probe.
    Ping = 4,
    /// Keep-alive answer.
    Pong = 5,
    /// Full subscription replacement.
    FilterUpdate = 6,
    /// A routed data message.
    Data = 7,
    /// Flow-control replenishment.
    Credit = 8,
    /// A store mutation.
    StoreCommand = 9,
    /// A replicated store outcome.
    StoreEvent = 10,
    /// A store read.
    StoreRequest = 11,
    /// The answer to a store read.
    StoreResponse = 12,
}

impl TryFrom<u8> for FrameType {
    type Error = FabError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Ok(match value {
            1 => FrameType::Hello,
            2 => FrameType::HelloAck,
            3 => FrameType::Goodbye,
            4 => FrameType::Ping,
            5 => FrameType::Pong,
            6 => FrameType::FilterUpdate,
            7 => FrameType::Data,
            8 => FrameType::Credit,
            9 => FrameType::StoreCommand,
            10 => FrameType::StoreEvent,
            11 => FrameType::StoreRequest,
            12 => FrameType::StoreResponse,
            _ => {
                return Err(FabError::protocol(format!(
                    "unknown frame type: {value}"
                )))
            }
        })
    }
}

/// A typed wire frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    /// Handshake opener: protocol version, sender identity, and the
    /// sender's initial subscription filter.
    Hello {
        /// Protocol version of the sender.
        version: u32,
        /// Stable identity of the sending endpoint.
        peer: EndpointId,
        /// The sender's current canonical filter.
        filter: Filter,
    },
    /// Handshake acknowledgement carrying the acker's identity.
    HelloAck {
        /// Stable identity of the acking endpoint.
        peer: EndpointId,
    },
    /// Graceful unpeer notification.
    Goodbye,
    /// Keep-alive probe.
    Ping,
    /// Keep-alive answer.
    Pong,
    /// Full replacement of the sender's subscription filter.
    FilterUpdate {
        /// The new canonical filter.
        filter: Filter,
    },
    /// A routed data message.
    Data {
        /// Hop counter; the message is dropped once it reaches the
        /// configured maximum.
        hops: u16,
        /// Stream name.
        topic: Topic,
        /// Payload.
        value: Value,
    },
    /// Flow-control replenishment: the receiver consumed `n` data
    /// frames since the last credit round.
    Credit {
        /// Number of credits returned.
        n: u32,
    },
    /// A store mutation on its way to the master.
    StoreCommand {
        /// Per-(publisher, store) sequence number.
        seq: u64,
        /// The endpoint that issued the command.
        publisher: EndpointId,
        /// Store name.
        store: String,
        /// The mutation.
        command: Command,
    },
    /// A replicated store outcome on its way to clones.
    StoreEvent {
        /// Per-publisher sequence number.
        seq: u64,
        /// The master that produced the event.
        publisher: EndpointId,
        /// Store name.
        store: String,
        /// The outcome.
        event: Event,
    },
    /// A store read on its way to the master.
    StoreRequest {
        /// Correlates the response, monotonic per endpoint.
        request_id: u64,
        /// Where to send the response.
        requester: EndpointId,
        /// Store name.
        store: String,
        /// The read.
        query: Query,
    },
    /// The answer to a store read or a responding command, published on
    /// the requester's response topic.
    StoreResponse {
        /// Correlates with the request.
        request_id: u64,
        /// The endpoint being answered; routing derives the response
        /// topic from it.
        requester: EndpointId,
        /// The outcome.
        reply: QueryReply,
    },
}

impl Frame {
    /// The frame type byte of this frame.
    pub fn frame_type(&self) -> FrameType {
        match self {
            Frame::Hello { .. } => FrameType::Hello,
            Frame::HelloAck { .. } => FrameType::HelloAck,
            Frame::Goodbye => FrameType::Goodbye,
            Frame::Ping => FrameType::Ping,
            Frame::Pong => FrameType::Pong,
            Frame::FilterUpdate { .. } => FrameType::FilterUpdate,
            Frame::Data { .. } => FrameType::Data,
            Frame::Credit { .. } => FrameType::Credit,
            Frame::StoreCommand { .. } => FrameType::StoreCommand,
            Frame::StoreEvent { .. } => FrameType::StoreEvent,
            Frame::StoreRequest { .. } => FrameType::StoreRequest,
            Frame::StoreResponse { .. } => FrameType::StoreResponse,
        }
    }

    /// Encode this frame as `frame_type:u8 || payload`, ready to hand
    /// to a transport connection.
    pub fn encode(&self) -> Bytes {
        let mut buf = BytesMut::new();
        buf.put_u8(self.frame_type() as u8);
        match self {
            Frame::Hello {
                version,
                peer,
                filter,
            } => {
                buf.put_u32_le(*version);
                buf.put_slice(peer.as_bytes());
                put_filter(filter, &mut buf);
            }
            Frame::HelloAck { peer } => {
                buf.put_slice(peer.as_bytes());
            }
            Frame::Goodbye | Frame::Ping | Frame::Pong => (),
            Frame::FilterUpdate { filter } => {
                put_filter(filter, &mut buf);
            }
            Frame::Data { hops, topic, value } => {
                buf.put_u16_le(*hops);
                codec::encode_into(
                    &Value::Str(topic.as_str().into()),
                    &mut buf,
                );
                codec::encode_into(value, &mut buf);
            }
            Frame::Credit { n } => {
                buf.put_u32_le(*n);
            }
            Frame::StoreCommand {
                seq,
                publisher,
                store,
                command,
            } => {
                buf.put_u64_le(*seq);
                buf.put_slice(publisher.as_bytes());
                put_str(store, &mut buf);
                put_command(command, &mut buf);
            }
            Frame::StoreEvent {
                seq,
                publisher,
                store,
                event,
            } => {
                buf.put_u64_le(*seq);
                buf.put_slice(publisher.as_bytes());
                put_str(store, &mut buf);
                put_event(event, &mut buf);
            }
            Frame::StoreRequest {
                request_id,
                requester,
                store,
                query,
            } => {
                buf.put_u64_le(*request_id);
                buf.put_slice(requester.as_bytes());
                put_str(store, &mut buf);
                put_query(query, &mut buf);
            }
            Frame::StoreResponse {
                request_id,
                requester,
                reply,
            } => {
                buf.put_u64_le(*request_id);
                buf.put_slice(requester.as_bytes());
                put_reply(reply, &mut buf);
            }
        }
        buf.freeze()
    }

    /// Decode a frame from one length-framed sequence. The entire input
    /// must be consumed; trailing garbage is a protocol error.
    pub fn decode(input: &[u8]) -> FabResult<Frame> {
        let mut buf = input;
        let ty = FrameType::try_from(read_u8(&mut buf)?)?;
        let frame = match ty {
            FrameType::Hello => {
                let version = read_u32_le(&mut buf)?;
                let peer = read_endpoint_id(&mut buf)?;
                let filter = read_filter(&mut buf)?;
                Frame::Hello {
                    version,
                    peer,
                    filter,
                }
            }
            FrameType::HelloAck => Frame::HelloAck {
                peer: read_endpoint_id(&mut buf)?,
            },
            FrameType::Goodbye => Frame::Goodbye,
            FrameType::Ping => Frame::Ping,
            FrameType::Pong => Frame::Pong,
            FrameType::FilterUpdate => Frame::FilterUpdate {
                filter: read_filter(&mut buf)?,
            },
            FrameType::Data => {
                let hops = read_u16_le(&mut buf)?;
                let topic = read_topic(&mut buf)?;
                let value = read_value(&mut buf)?;
                Frame::Data { hops, topic, value }
            }
            FrameType::Credit => Frame::Credit {
                n: read_u32_le(&mut buf)?,
            },
            FrameType::StoreCommand => {
                let seq = read_u64_le(&mut buf)?;
                let publisher = read_endpoint_id(&mut buf)?;
                let store = read_str(&mut buf)?;
                let command = read_command(&mut buf)?;
                Frame::StoreCommand {
                    seq,
                    publisher,
                    store,
                    command,
                }
            }
            FrameType::StoreEvent => {
                let seq = read_u64_le(&mut buf)?;
                let publisher = read_endpoint_id(&mut buf)?;
                let store = read_str(&mut buf)?;
                let event = read_event(&mut buf)?;
                Frame::StoreEvent {
                    seq,
                    publisher,
                    store,
                    event,
                }
            }
            FrameType::StoreRequest => {
                let request_id = read_u64_le(&mut buf)?;
                let requester = read_endpoint_id(&mut buf)?;
                let store = read_str(&mut buf)?;
                let query = read_query(&mut buf)?;
                Frame::StoreRequest {
                    request_id,
                    requester,
                    store,
                    query,
                }
            }
            FrameType::StoreResponse => {
                let request_id = read_u64_le(&mut buf)?;
                let requester = read_endpoint_id(&mut buf)?;
                let reply = read_reply(&mut buf)?;
                Frame::StoreResponse {
                    request_id,
                    requester,
                    reply,
                }
            }
        };
        if !buf.is_empty() {
            return Err(FabError::protocol(format!(
                "{} trailing bytes after {ty:?} frame",
                buf.len()
            )));
        }
        Ok(frame)
    }
}

fn put_filter(filter: &Filter, buf: &mut BytesMut) {
    let as_value =
        Value::set(filter.iter().map(|p| Value::Str(p.to_string())));
    codec::encode_into(&as_value, buf);
}

fn read_filter(buf: &mut &[u8]) -> FabResult<Filter> {
    match read_value(buf)? {
        Value::Set(set) => {
            let mut out = Filter::new();
            for v in set {
                match v {
                    Value::Str(s) => {
                        out.add(s);
                    }
                    other => {
                        return Err(FabError::protocol(format!(
                            "filter element must be a string, got {:?}",
                            other.kind()
                        )))
                    }
                }
            }
            Ok(out)
        }
        other => Err(FabError::protocol(format!(
            "filter must be a set of strings, got {:?}",
            other.kind()
        ))),
    }
}

fn read_topic(buf: &mut &[u8]) -> FabResult<Topic> {
    match read_value(buf)? {
        Value::Str(s) => Topic::new(s)
            .map_err(|_| FabError::protocol("empty topic in data frame")),
        other => Err(FabError::protocol(format!(
            "topic must be a string, got {:?}",
            other.kind()
        ))),
    }
}

fn read_value(buf: &mut &[u8]) -> FabResult<Value> {
    let (v, rest) = codec::decode(buf)?;
    *buf = rest;
    Ok(v)
}

fn read_endpoint_id(buf: &mut &[u8]) -> FabResult<EndpointId> {
    let raw: [u8; 16] = take(buf, 16)?.try_into().expect("len checked");
    Ok(EndpointId::from_bytes(raw))
}

fn put_str(s: &str, buf: &mut BytesMut) {
    buf.put_u32_le(s.len() as u32);
    buf.put_slice(s.as_bytes());
}

fn read_str(buf: &mut &[u8]) -> FabResult<String> {
    let len = read_u32_le(buf)? as usize;
    let raw = take(buf, len)?;
    String::from_utf8(raw.to_vec())
        .map_err(|_| FabError::protocol("invalid utf-8 in string field"))
}

fn put_expiry(expiry: &Option<Timestamp>, buf: &mut BytesMut) {
    match expiry {
        None => buf.put_u8(0),
        Some(at) => {
            buf.put_u8(1);
            buf.put_i64_le(at.as_nanos());
        }
    }
}

fn read_expiry(buf: &mut &[u8]) -> FabResult<Option<Timestamp>> {
    match read_u8(buf)? {
        0 => Ok(None),
        1 => Ok(Some(Timestamp::from_nanos(read_u64_le(buf)? as i64))),
        other => Err(FabError::protocol(format!(
            "expiry flag must be 0 or 1, got {other}"
        ))),
    }
}

fn put_command(command: &Command, buf: &mut BytesMut) {
    match command {
        Command::Put { key, value, expiry } => {
            buf.put_u8(1);
            codec::encode_into(key, buf);
            codec::encode_into(value, buf);
            put_expiry(expiry, buf);
        }
        Command::Add {
            request_id,
            key,
            delta,
            expiry,
        } => {
            buf.put_u8(2);
            buf.put_u64_le(*request_id);
            codec::encode_into(key, buf);
            codec::encode_into(delta, buf);
            put_expiry(expiry, buf);
        }
        Command::Subtract {
            request_id,
            key,
            delta,
            expiry,
        } => {
            buf.put_u8(3);
            buf.put_u64_le(*request_id);
            codec::encode_into(key, buf);
            codec::encode_into(delta, buf);
            put_expiry(expiry, buf);
        }
        Command::Erase { key } => {
            buf.put_u8(4);
            codec::encode_into(key, buf);
        }
        Command::Expire { request_id, key } => {
            buf.put_u8(7);
            buf.put_u64_le(*request_id);
            codec::encode_into(key, buf);
        }
        Command::PutUnique {
            request_id,
            key,
            value,
            expiry,
        } => {
            buf.put_u8(5);
            buf.put_u64_le(*request_id);
            codec::encode_into(key, buf);
            codec::encode_into(value, buf);
            put_expiry(expiry, buf);
        }
        Command::Clear => {
            buf.put_u8(6);
        }
    }
}

fn read_command(buf: &mut &[u8]) -> FabResult<Command> {
    Ok(match read_u8(buf)? {
        1 => Command::Put {
            key: read_value(buf)?,
            value: read_value(buf)?,
            expiry: read_expiry(buf)?,
        },
        2 => Command::Add {
            request_id: read_u64_le(buf)?,
            key: read_value(buf)?,
            delta: read_value(buf)?,
            expiry: read_expiry(buf)?,
        },
        3 => Command::Subtract {
            request_id: read_u64_le(buf)?,
            key: read_value(buf)?,
            delta: read_value(buf)?,
            expiry: read_expiry(buf)?,
        },
        4 => Command::Erase {
            key: read_value(buf)?,
        },
        7 => Command::Expire {
            request_id: read_u64_le(buf)?,
            key: read_value(buf)?,
        },
        5 => Command::PutUnique {
            request_id: read_u64_le(buf)?,
            key: read_value(buf)?,
            value: read_value(buf)?,
            expiry: read_expiry(buf)?,
        },
        6 => Command::Clear,
        other => {
            return Err(FabError::protocol(format!(
                "unknown store command tag: {other}"
            )))
        }
    })
}

fn put_event(event: &Event, buf: &mut BytesMut) {
    match event {
        Event::Update { key, value, expiry } => {
            buf.put_u8(1);
            codec::encode_into(key, buf);
            codec::encode_into(value, buf);
            put_expiry(expiry, buf);
        }
        Event::Erase { key } => {
            buf.put_u8(2);
            codec::encode_into(key, buf);
        }
        Event::Expire { key } => {
            buf.put_u8(3);
            codec::encode_into(key, buf);
        }
        Event::Clear => {
            buf.put_u8(4);
        }
    }
}

fn read_event(buf: &mut &[u8]) -> FabResult<Event> {
    Ok(match read_u8(buf)? {
        1 => Event::Update {
            key: read_value(buf)?,
            value: read_value(buf)?,
            expiry: read_expiry(buf)?,
        },
        2 => Event::Erase {
            key: read_value(buf)?,
        },
        3 => Event::Expire {
            key: read_value(buf)?,
        },
        4 => Event::Clear,
        other => {
            return Err(FabError::protocol(format!(
                "unknown store event tag: {other}"
            )))
        }
    })
}

fn put_query(query: &Query, buf: &mut BytesMut) {
    match query {
        Query::Get { key } => {
            buf.put_u8(1);
            codec::encode_into(key, buf);
        }
        Query::GetAspect { key, aspect } => {
            buf.put_u8(2);
            codec::encode_into(key, buf);
            codec::encode_into(aspect, buf);
        }
        Query::Exists { key } => {
            buf.put_u8(3);
            codec::encode_into(key, buf);
        }
        Query::Keys => {
            buf.put_u8(4);
        }
        Query::Size => {
            buf.put_u8(5);
        }
        Query::Snapshot => {
            buf.put_u8(6);
        }
    }
}

fn read_query(buf: &mut &[u8]) -> FabResult<Query> {
    Ok(match read_u8(buf)? {
        1 => Query::Get {
            key: read_value(buf)?,
        },
        2 => Query::GetAspect {
            key: read_value(buf)?,
            aspect: read_value(buf)?,
        },
        3 => Query::Exists {
            key: read_value(buf)?,
        },
        4 => Query::Keys,
        5 => Query::Size,
        6 => Query::Snapshot,
        other => {
            return Err(FabError::protocol(format!(
                "unknown store query tag: {other}"
            )))
        }
    })
}

fn put_reply(reply: &QueryReply, buf: &mut BytesMut) {
    match reply {
        QueryReply::Err { code, context } => {
            buf.put_u8(0);
            buf.put_u8(code.tag());
            put_str(context, buf);
        }
        QueryReply::Ok(v) => {
            buf.put_u8(1);
            codec::encode_into(v, buf);
        }
        QueryReply::Entries(entries) => {
            buf.put_u8(2);
            buf.put_u32_le(entries.len() as u32);
            for e in entries {
                codec::encode_into(&e.key, buf);
                codec::encode_into(&e.value, buf);
                put_expiry(&e.expiry, buf);
            }
        }
    }
}

fn read_reply(buf: &mut &[u8]) -> FabResult<QueryReply> {
    Ok(match read_u8(buf)? {
        0 => QueryReply::Err {
            code: ErrorCode::from_tag(read_u8(buf)?),
            context: read_str(buf)?,
        },
        1 => QueryReply::Ok(read_value(buf)?),
        2 => {
            let len = read_u32_le(buf)?;
            let mut entries = Vec::new();
            for _ in 0..len {
                entries.push(Entry {
                    key: read_value(buf)?,
                    value: read_value(buf)?,
                    expiry: read_expiry(buf)?,
                });
            }
            QueryReply::Entries(entries)
        }
        other => {
            return Err(FabError::protocol(format!(
                "unknown store reply tag: {other}"
            )))
        }
    })
}
