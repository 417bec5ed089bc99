//! Wire encoding of service records stored in the coordination store.

use crate::types::ServiceRecord;

#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("Failed to encode service record: {0}")]
    Encode(#[source] serde_json::Error),

    #[error("Failed to decode service record: {0}")]
    Decode(#[source] serde_json::Error),
}

pub fn encode(record: &ServiceRecord) -> Result<Vec<u8>, CodecError> {
    serde_json::to_vec(record).map_err(CodecError::Encode)
}

pub fn decode(data: &[u8]) -> Result<ServiceRecord, CodecError> {
    serde_json::from_slice(data).map_err(CodecError::Decode)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::BTreeMap;
    use uuid::Uuid;

    #[test]
    fn test_roundtrip_untyped_without_properties() {
        let record = ServiceRecord::new("svc", None, None, BTreeMap::new()).unwrap();
        let decoded = decode(&encode(&record).unwrap()).unwrap();

        assert_eq!(decoded, record);
        assert_eq!(decoded.service_type(), None);
        assert_eq!(decoded.announcement_name(), record.announcement_name());
    }

    #[test]
    fn test_roundtrip_with_properties() {
        let record =
            ServiceRecord::static_announcement(None, "svc", Some("https"), "https", "1.2.3.4", 443)
                .unwrap();
        let decoded = decode(&encode(&record).unwrap()).unwrap();

        assert_eq!(decoded, record);
        assert!(decoded.is_static_announcement());
    }

    #[test]
    fn test_decode_minimal_payload() {
        let id = Uuid::from_u128(42);
        let json = format!(r#"{{"serviceName":"svc","serviceId":"{}"}}"#, id);
        let decoded = decode(json.as_bytes()).unwrap();

        assert_eq!(decoded.service_id(), id);
        assert!(decoded.properties().is_empty());
        assert!(!decoded.is_static_announcement());
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(decode(b"not json").is_err());
        assert!(decode(br#"{"serviceName":""}"#).is_err());
        assert!(decode(br#"{"serviceType":"http"}"#).is_err());
    }
}
