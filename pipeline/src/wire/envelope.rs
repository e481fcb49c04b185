//! Envelope wrapping and type-URL resolution
//!
//! Every topic payload travels inside a [`TopicEnvelope`] whose `payload` is
//! a packed `Any`. The decoder registry here resolves the fully-qualified
//! message name to a concrete decoder; unknown names are an error rather
//! than a silent drop so that operators see schema drift immediately.

use prost::Message;
use prost_types::Any;
use uuid::Uuid;

use super::{BatchInfo, MetadataInfo, TopicEnvelope};
use crate::utils::time::now_ms;

/// Canonical type-URL prefix used when wrapping.
const TYPE_URL_PREFIX: &str = "type.googleapis.com";

const BATCH_INFO_NAME: &str = "vivarium.BatchInfo";
const METADATA_INFO_NAME: &str = "vivarium.MetadataInfo";

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("unknown payload type: {0}")]
    UnknownType(String),

    #[error("envelope has no payload")]
    MissingPayload,

    #[error("payload decode failed for {type_name}: {source}")]
    Decode {
        type_name: String,
        source: prost::DecodeError,
    },
}

/// A payload resolved through the decoder registry.
#[derive(Debug, Clone, PartialEq)]
pub enum DecodedPayload {
    Batch(BatchInfo),
    Metadata(MetadataInfo),
}

impl DecodedPayload {
    /// Fully-qualified message name of the wrapped payload.
    pub fn type_name(&self) -> &'static str {
        match self {
            DecodedPayload::Batch(_) => BATCH_INFO_NAME,
            DecodedPayload::Metadata(_) => METADATA_INFO_NAME,
        }
    }

    fn encode(&self) -> Vec<u8> {
        match self {
            DecodedPayload::Batch(m) => m.encode_to_vec(),
            DecodedPayload::Metadata(m) => m.encode_to_vec(),
        }
    }
}

impl From<BatchInfo> for DecodedPayload {
    fn from(info: BatchInfo) -> Self {
        DecodedPayload::Batch(info)
    }
}

impl From<MetadataInfo> for DecodedPayload {
    fn from(info: MetadataInfo) -> Self {
        DecodedPayload::Metadata(info)
    }
}

/// Wrap a payload into a ready-to-publish envelope with a fresh message id
/// and the writer's wall clock.
pub fn wrap_payload(payload: &DecodedPayload) -> TopicEnvelope {
    TopicEnvelope {
        message_id: Uuid::new_v4().to_string(),
        timestamp: now_ms(),
        payload: Some(Any {
            type_url: format!("{}/{}", TYPE_URL_PREFIX, payload.type_name()),
            value: payload.encode(),
        }),
    }
}

/// Unwrap an envelope back into its concrete payload.
///
/// The type URL is matched on the substring after the first `/`; any prefix
/// (or none at all) is accepted.
pub fn unwrap_envelope(envelope: &TopicEnvelope) -> Result<DecodedPayload, EnvelopeError> {
    let any = envelope.payload.as_ref().ok_or(EnvelopeError::MissingPayload)?;
    let type_name = any
        .type_url
        .split_once('/')
        .map(|(_, name)| name)
        .unwrap_or(any.type_url.as_str());

    match type_name {
        BATCH_INFO_NAME => BatchInfo::decode(&any.value[..])
            .map(DecodedPayload::Batch)
            .map_err(|source| EnvelopeError::Decode {
                type_name: type_name.to_string(),
                source,
            }),
        METADATA_INFO_NAME => MetadataInfo::decode(&any.value[..])
            .map(DecodedPayload::Metadata)
            .map_err(|source| EnvelopeError::Decode {
                type_name: type_name.to_string(),
                source,
            }),
        other => Err(EnvelopeError::UnknownType(other.to_string())),
    }
}
