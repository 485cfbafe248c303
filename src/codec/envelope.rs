//! Envelope messages
//!
//! The top-level protobuf message carried inside every record. Exactly
//! one envelope per record; the framer never splits or merges them.
//! Field numbers are load-bearing: deployed peers encode with these
//! exact tags, so they must not be renumbered.

use prost::Message;

/// Control message announcing a client stream.
///
/// `local_addr` uniquely names one transport stream of one client
/// (`"{vip}:{local-port}"` in practice, but the server treats it as an
/// opaque key); `ip` is the sender's TUN IPv4 address as a dotted quad.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Ping {
    #[prost(int64, tag = "1")]
    pub timestamp: i64,
    #[prost(string, tag = "2")]
    pub local_addr: ::prost::alloc::string::String,
    #[prost(string, tag = "3")]
    pub local_private_addr: ::prost::alloc::string::String,
    #[prost(string, tag = "4")]
    pub dc: ::prost::alloc::string::String,
    #[prost(string, tag = "5")]
    pub ip: ::prost::alloc::string::String,
}

/// An encapsulated IPv4 packet.
#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Packet {
    #[prost(bytes = "vec", tag = "1")]
    pub payload: ::prost::alloc::vec::Vec<u8>,
}

#[derive(Clone, PartialEq, ::prost::Message)]
pub struct Envelope {
    #[prost(oneof = "envelope::Type", tags = "1, 2")]
    pub r#type: ::core::option::Option<envelope::Type>,
}

/// Nested message and enum types in `Envelope`.
pub mod envelope {
    #[derive(Clone, PartialEq, ::prost::Oneof)]
    pub enum Type {
        #[prost(message, tag = "1")]
        Ping(super::Ping),
        #[prost(message, tag = "2")]
        Packet(super::Packet),
    }
}

impl Envelope {
    /// Encodes a `Packet` envelope around one IP packet.
    pub fn encode_packet(payload: &[u8]) -> Vec<u8> {
        Envelope {
            r#type: Some(envelope::Type::Packet(Packet {
                payload: payload.to_vec(),
            })),
        }
        .encode_to_vec()
    }

    /// Encodes a `Ping` envelope.
    pub fn encode_ping(ping: Ping) -> Vec<u8> {
        Envelope {
            r#type: Some(envelope::Type::Ping(ping)),
        }
        .encode_to_vec()
    }
}
