use std::collections::BTreeSet;
use std::io::Read;

use flate2::read::GzDecoder;

use crate::error::{Error, Result};

/// Maximum length of a single topic name, in bytes. Recommended by the
/// broker's data model; enforced here rather than left to callers since
/// every caller needs the same limit.
pub const MAX_TOPIC_LEN: usize = 128;

const SEPARATOR: u8 = b' ';

/// How a `TOPIC_SUBSCRIPTION` frame's `topics` byte string is compressed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TopicListFormat {
    /// Whitespace-separated topic names, uncompressed UTF-8.
    Plain,
    /// Whitespace-separated topic names, gzip-compressed UTF-8.
    Gzip,
}

impl TopicListFormat {
    pub fn from_tag(tag: u8) -> Result<Self> {
        match tag {
            0 => Ok(Self::Plain),
            1 => Ok(Self::Gzip),
            other => Err(Error::UnknownTopicListFormat(other)),
        }
    }

    pub fn tag(self) -> u8 {
        match self {
            Self::Plain => 0,
            Self::Gzip => 1,
        }
    }
}

/// Validate a single topic name: non-empty would be nice but the spec
/// doesn't require it, so the only hard rule is "no separator byte" and
/// the recommended length bound.
pub fn validate_topic_name(topic: &str) -> Result<()> {
    if topic.len() > MAX_TOPIC_LEN {
        return Err(Error::FieldTooLarge {
            actual: topic.len(),
            limit: MAX_TOPIC_LEN,
        });
    }
    if topic.as_bytes().contains(&SEPARATOR) {
        return Err(Error::TopicContainsSeparator);
    }
    Ok(())
}

/// Decode a `TOPIC_SUBSCRIPTION` payload into the deduplicated set of
/// topics it names. An empty payload decodes to an empty set (which, per
/// the set-replace semantics in the comm-server's subscription index,
/// clears every subscription the sender previously held).
pub fn decode_topic_list(format: TopicListFormat, raw: &[u8]) -> Result<BTreeSet<String>> {
    let plain = match format {
        TopicListFormat::Plain => raw.to_vec(),
        TopicListFormat::Gzip => {
            let mut decoder = GzDecoder::new(raw);
            let mut out = Vec::new();
            decoder.read_to_end(&mut out)?;
            out
        }
    };

    let text = std::str::from_utf8(&plain).map_err(|_| Error::InvalidTopicListUtf8)?;

    let mut topics = BTreeSet::new();
    for word in text.split_whitespace() {
        topics.insert(word.to_string());
    }
    Ok(topics)
}

/// Encode a topic set the way [`decode_topic_list`] expects to read it
/// back. Used by tests and by any peer-side code that needs to produce a
/// `TOPIC_SUBSCRIPTION` frame.
pub fn encode_topic_list(topics: &BTreeSet<String>, format: TopicListFormat) -> Result<Vec<u8>> {
    for topic in topics {
        validate_topic_name(topic)?;
    }
    let plain = topics
        .iter()
        .cloned()
        .collect::<Vec<_>>()
        .join(" ")
        .into_bytes();

    match format {
        TopicListFormat::Plain => Ok(plain),
        TopicListFormat::Gzip => {
            use flate2::write::GzEncoder;
            use flate2::Compression;
            use std::io::Write;

            let mut encoder = GzEncoder::new(Vec::new(), Compression::default());
            encoder.write_all(&plain)?;
            Ok(encoder.finish()?)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn plain_round_trip() {
        let topics: BTreeSet<String> = ["profile", "chat"].iter().map(|s| s.to_string()).collect();
        let encoded = encode_topic_list(&topics, TopicListFormat::Plain).unwrap();
        let decoded = decode_topic_list(TopicListFormat::Plain, &encoded).unwrap();
        assert_eq!(topics, decoded);
    }

    #[test]
    fn gzip_round_trip() {
        let topics: BTreeSet<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
        let encoded = encode_topic_list(&topics, TopicListFormat::Gzip).unwrap();
        let decoded = decode_topic_list(TopicListFormat::Gzip, &encoded).unwrap();
        assert_eq!(topics, decoded);
    }

    #[test]
    fn empty_payload_is_empty_set() {
        let decoded = decode_topic_list(TopicListFormat::Plain, &[]).unwrap();
        assert!(decoded.is_empty());
    }

    #[test]
    fn duplicate_topics_count_once() {
        let decoded = decode_topic_list(TopicListFormat::Plain, b"profile profile chat").unwrap();
        assert_eq!(decoded.len(), 2);
    }

    #[test]
    fn separator_byte_rejected() {
        let mut topics = BTreeSet::new();
        topics.insert("has space".to_string());
        assert!(matches!(
            encode_topic_list(&topics, TopicListFormat::Plain),
            Err(Error::TopicContainsSeparator)
        ));
    }
}
