use bytes::{BufMut, BytesMut};

use crate::compression::{validate_topic_name, TopicListFormat};
use crate::error::{Error, Result};
use crate::Alias;

const TAG_WELCOME: u8 = 0x01;
const TAG_CONNECT: u8 = 0x02;
const TAG_WEBRTC_OFFER: u8 = 0x03;
const TAG_WEBRTC_ANSWER: u8 = 0x04;
const TAG_WEBRTC_ICE_CANDIDATE: u8 = 0x05;
const TAG_AUTH: u8 = 0x06;
const TAG_TOPIC: u8 = 0x07;
const TAG_TOPIC_SUBSCRIPTION: u8 = 0x08;

/// A peer's declared role, carried on the wire in `AUTH` frames and used
/// to decide how the coordinator's server-selector and the comm-server's
/// single-hop mesh rule treat the peer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Role {
    Unknown,
    Client,
    CommunicationServer,
}

impl Role {
    fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Self::Unknown),
            1 => Ok(Self::Client),
            2 => Ok(Self::CommunicationServer),
            other => Err(Error::UnknownRole(other)),
        }
    }

    fn tag(self) -> u8 {
        match self {
            Self::Unknown => 0,
            Self::Client => 1,
            Self::CommunicationServer => 2,
        }
    }
}

/// The type tag of a wire message, without its body. Lets the comm-server
/// and coordinator dispatch on message kind before paying for a full
/// decode, matching the codec's `header` variant in the data model.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Header {
    Welcome,
    Connect,
    WebrtcOffer,
    WebrtcAnswer,
    WebrtcIceCandidate,
    Auth,
    Topic,
    TopicSubscription,
}

/// One decoded protocol message. Variant fields mirror the wire schema in
/// the external-interfaces section of the spec exactly; nothing here is
/// an implementation convenience field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WireMessage {
    Welcome {
        alias: Alias,
        available_servers: Vec<Alias>,
    },
    Connect {
        from_alias: Alias,
        to_alias: Alias,
    },
    WebrtcOffer {
        from_alias: Alias,
        to_alias: Alias,
        sdp: String,
    },
    WebrtcAnswer {
        from_alias: Alias,
        to_alias: Alias,
        sdp: String,
    },
    WebrtcIceCandidate {
        from_alias: Alias,
        to_alias: Alias,
        candidate: String,
    },
    Auth {
        role: Role,
        method: String,
        body: Vec<u8>,
    },
    Topic {
        from_alias: Alias,
        topic: String,
        body: Vec<u8>,
    },
    TopicSubscription {
        format: TopicListFormat,
        topics: Vec<u8>,
    },
}

impl WireMessage {
    pub fn header(&self) -> Header {
        match self {
            Self::Welcome { .. } => Header::Welcome,
            Self::Connect { .. } => Header::Connect,
            Self::WebrtcOffer { .. } => Header::WebrtcOffer,
            Self::WebrtcAnswer { .. } => Header::WebrtcAnswer,
            Self::WebrtcIceCandidate { .. } => Header::WebrtcIceCandidate,
            Self::Auth { .. } => Header::Auth,
            Self::Topic { .. } => Header::Topic,
            Self::TopicSubscription { .. } => Header::TopicSubscription,
        }
    }

    /// Encode this message into a fresh buffer.
    pub fn encode(&self) -> Result<Vec<u8>> {
        let mut out = BytesMut::new();
        match self {
            Self::Welcome {
                alias,
                available_servers,
            } => {
                out.put_u8(TAG_WELCOME);
                out.put_u64(*alias);
                out.put_u32(available_servers.len() as u32);
                for server in available_servers {
                    out.put_u64(*server);
                }
            }
            Self::Connect {
                from_alias,
                to_alias,
            } => {
                out.put_u8(TAG_CONNECT);
                out.put_u64(*from_alias);
                out.put_u64(*to_alias);
            }
            Self::WebrtcOffer {
                from_alias,
                to_alias,
                sdp,
            } => {
                out.put_u8(TAG_WEBRTC_OFFER);
                out.put_u64(*from_alias);
                out.put_u64(*to_alias);
                put_str(&mut out, sdp)?;
            }
            Self::WebrtcAnswer {
                from_alias,
                to_alias,
                sdp,
            } => {
                out.put_u8(TAG_WEBRTC_ANSWER);
                out.put_u64(*from_alias);
                out.put_u64(*to_alias);
                put_str(&mut out, sdp)?;
            }
            Self::WebrtcIceCandidate {
                from_alias,
                to_alias,
                candidate,
            } => {
                out.put_u8(TAG_WEBRTC_ICE_CANDIDATE);
                out.put_u64(*from_alias);
                out.put_u64(*to_alias);
                put_str(&mut out, candidate)?;
            }
            Self::Auth { role, method, body } => {
                out.put_u8(TAG_AUTH);
                out.put_u8(role.tag());
                put_str(&mut out, method)?;
                put_bytes(&mut out, body)?;
            }
            Self::Topic {
                from_alias,
                topic,
                body,
            } => {
                validate_topic_name(topic)?;
                out.put_u8(TAG_TOPIC);
                out.put_u64(*from_alias);
                put_str(&mut out, topic)?;
                put_bytes(&mut out, body)?;
            }
            Self::TopicSubscription { format, topics } => {
                out.put_u8(TAG_TOPIC_SUBSCRIPTION);
                out.put_u8(format.tag());
                put_bytes(&mut out, topics)?;
            }
        }
        Ok(out.to_vec())
    }

    /// Decode a complete message from `buf`. `buf` must contain exactly
    /// one message (WebSocket and data-channel frames are already
    /// message-delimited by the transport).
    pub fn decode(buf: &[u8]) -> Result<Self> {
        let mut r = Reader::new(buf);
        let tag = r.read_u8()?;
        let msg = match tag {
            TAG_WELCOME => {
                let alias = r.read_u64()?;
                let count = r.read_u32()? as usize;
                let mut available_servers = Vec::with_capacity(count.min(1024));
                for _ in 0..count {
                    available_servers.push(r.read_u64()?);
                }
                Self::Welcome {
                    alias,
                    available_servers,
                }
            }
            TAG_CONNECT => Self::Connect {
                from_alias: r.read_u64()?,
                to_alias: r.read_u64()?,
            },
            TAG_WEBRTC_OFFER => {
                let from_alias = r.read_u64()?;
                let to_alias = r.read_u64()?;
                let sdp = r.read_str()?.to_string();
                Self::WebrtcOffer {
                    from_alias,
                    to_alias,
                    sdp,
                }
            }
            TAG_WEBRTC_ANSWER => {
                let from_alias = r.read_u64()?;
                let to_alias = r.read_u64()?;
                let sdp = r.read_str()?.to_string();
                Self::WebrtcAnswer {
                    from_alias,
                    to_alias,
                    sdp,
                }
            }
            TAG_WEBRTC_ICE_CANDIDATE => {
                let from_alias = r.read_u64()?;
                let to_alias = r.read_u64()?;
                let candidate = r.read_str()?.to_string();
                Self::WebrtcIceCandidate {
                    from_alias,
                    to_alias,
                    candidate,
                }
            }
            TAG_AUTH => {
                let role = Role::from_tag(r.read_u8()?)?;
                let method = r.read_str()?.to_string();
                let body = r.read_bytes_field()?.to_vec();
                Self::Auth { role, method, body }
            }
            TAG_TOPIC => {
                let from_alias = r.read_u64()?;
                let topic = r.read_str()?.to_string();
                let body = r.read_bytes_field()?.to_vec();
                Self::Topic {
                    from_alias,
                    topic,
                    body,
                }
            }
            TAG_TOPIC_SUBSCRIPTION => {
                let format = TopicListFormat::from_tag(r.read_u8()?)?;
                let topics = r.read_bytes_field()?.to_vec();
                Self::TopicSubscription { format, topics }
            }
            other => return Err(Error::UnknownTag(other)),
        };
        Ok(msg)
    }
}

/// Read only the type tag, without decoding the rest of the message.
pub fn peek_header(buf: &[u8]) -> Result<Header> {
    let mut r = Reader::new(buf);
    let tag = r.read_u8()?;
    match tag {
        TAG_WELCOME => Ok(Header::Welcome),
        TAG_CONNECT => Ok(Header::Connect),
        TAG_WEBRTC_OFFER => Ok(Header::WebrtcOffer),
        TAG_WEBRTC_ANSWER => Ok(Header::WebrtcAnswer),
        TAG_WEBRTC_ICE_CANDIDATE => Ok(Header::WebrtcIceCandidate),
        TAG_AUTH => Ok(Header::Auth),
        TAG_TOPIC => Ok(Header::Topic),
        TAG_TOPIC_SUBSCRIPTION => Ok(Header::TopicSubscription),
        other => Err(Error::UnknownTag(other)),
    }
}

/// Read just the topic field of a `TOPIC` frame, without touching (or
/// allocating for) the trailing payload. This is what lets the
/// comm-server's fan-out path decide where a frame goes without copying
/// the bytes it's about to copy again on the way out.
pub fn peek_topic(buf: &[u8]) -> Result<&str> {
    let mut r = Reader::new(buf);
    let tag = r.read_u8()?;
    if tag != TAG_TOPIC {
        return Err(Error::UnknownTag(tag));
    }
    let _from_alias = r.read_u64()?;
    r.read_str()
}

fn put_str(out: &mut BytesMut, s: &str) -> Result<()> {
    put_bytes(out, s.as_bytes())
}

fn put_bytes(out: &mut BytesMut, bytes: &[u8]) -> Result<()> {
    if bytes.len() > u32::MAX as usize {
        return Err(Error::FieldTooLarge {
            actual: bytes.len(),
            limit: u32::MAX as usize,
        });
    }
    out.put_u32(bytes.len() as u32);
    out.put_slice(bytes);
    Ok(())
}

/// Bounds-checked cursor over a decode buffer. `bytes::Buf` panics on
/// underrun, which is not acceptable for attacker-controlled wire input,
/// so reads here always go through a checked length guard first.
struct Reader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> Reader<'a> {
    fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn remaining(&self) -> usize {
        self.buf.len() - self.pos
    }

    fn need(&self, n: usize) -> Result<()> {
        if self.remaining() < n {
            return Err(Error::UnexpectedEof {
                needed: n,
                available: self.remaining(),
            });
        }
        Ok(())
    }

    fn read_u8(&mut self) -> Result<u8> {
        self.need(1)?;
        let v = self.buf[self.pos];
        self.pos += 1;
        Ok(v)
    }

    fn read_u32(&mut self) -> Result<u32> {
        self.need(4)?;
        let v = u32::from_be_bytes(self.buf[self.pos..self.pos + 4].try_into().unwrap());
        self.pos += 4;
        Ok(v)
    }

    fn read_u64(&mut self) -> Result<u64> {
        self.need(8)?;
        let v = u64::from_be_bytes(self.buf[self.pos..self.pos + 8].try_into().unwrap());
        self.pos += 8;
        Ok(v)
    }

    fn read_bytes_field(&mut self) -> Result<&'a [u8]> {
        let len = self.read_u32()? as usize;
        if len > 64 * 1024 * 1024 {
            return Err(Error::FieldTooLarge {
                actual: len,
                limit: 64 * 1024 * 1024,
            });
        }
        self.need(len)?;
        let slice = &self.buf[self.pos..self.pos + len];
        self.pos += len;
        Ok(slice)
    }

    fn read_str(&mut self) -> Result<&'a str> {
        let bytes = self.read_bytes_field()?;
        std::str::from_utf8(bytes).map_err(Error::from)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn roundtrip(msg: WireMessage) {
        let encoded = msg.encode().unwrap();
        let decoded = WireMessage::decode(&encoded).unwrap();
        assert_eq!(msg, decoded);
    }

    #[test]
    fn welcome_round_trips() {
        roundtrip(WireMessage::Welcome {
            alias: 42,
            available_servers: vec![1, 2, 3],
        });
        roundtrip(WireMessage::Welcome {
            alias: 7,
            available_servers: vec![],
        });
    }

    #[test]
    fn connect_round_trips() {
        roundtrip(WireMessage::Connect {
            from_alias: 1,
            to_alias: 2,
        });
    }

    #[test]
    fn offer_answer_ice_round_trip() {
        roundtrip(WireMessage::WebrtcOffer {
            from_alias: 1,
            to_alias: 2,
            sdp: "v=0\r\n...".to_string(),
        });
        roundtrip(WireMessage::WebrtcAnswer {
            from_alias: 2,
            to_alias: 1,
            sdp: "v=0\r\n...".to_string(),
        });
        roundtrip(WireMessage::WebrtcIceCandidate {
            from_alias: 1,
            to_alias: 2,
            candidate: "candidate:1 1 udp ...".to_string(),
        });
    }

    #[test]
    fn auth_round_trips() {
        roundtrip(WireMessage::Auth {
            role: Role::Client,
            method: "shared-secret".to_string(),
            body: b"token123".to_vec(),
        });
    }

    #[test]
    fn topic_round_trips_with_empty_payload() {
        roundtrip(WireMessage::Topic {
            from_alias: 9,
            topic: "profile".to_string(),
            body: vec![],
        });
        roundtrip(WireMessage::Topic {
            from_alias: 9,
            topic: "profile".to_string(),
            body: b"payload".to_vec(),
        });
    }

    #[test]
    fn topic_subscription_round_trips() {
        roundtrip(WireMessage::TopicSubscription {
            format: TopicListFormat::Plain,
            topics: b"profile chat".to_vec(),
        });
    }

    #[test]
    fn peek_header_matches_decoded_variant() {
        let msg = WireMessage::Topic {
            from_alias: 1,
            topic: "t".to_string(),
            body: vec![1, 2, 3],
        };
        let encoded = msg.encode().unwrap();
        assert_eq!(peek_header(&encoded).unwrap(), Header::Topic);
    }

    #[test]
    fn peek_topic_avoids_decoding_payload() {
        let msg = WireMessage::Topic {
            from_alias: 5,
            topic: "profile".to_string(),
            body: vec![0xFF; 4096],
        };
        let encoded = msg.encode().unwrap();
        assert_eq!(peek_topic(&encoded).unwrap(), "profile");
    }

    #[test]
    fn peek_topic_rejects_non_topic_messages() {
        let msg = WireMessage::Connect {
            from_alias: 1,
            to_alias: 2,
        };
        let encoded = msg.encode().unwrap();
        assert!(peek_topic(&encoded).is_err());
    }

    #[test]
    fn truncated_buffer_is_an_error_not_a_panic() {
        let msg = WireMessage::Connect {
            from_alias: 1,
            to_alias: 2,
        };
        let encoded = msg.encode().unwrap();
        let truncated = &encoded[..encoded.len() - 2];
        assert!(WireMessage::decode(truncated).is_err());
    }

    #[test]
    fn unknown_tag_is_rejected() {
        let buf = [0xEE, 0, 0, 0, 0];
        assert!(WireMessage::decode(&buf).is_err());
    }
}
