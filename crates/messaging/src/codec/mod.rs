mod error;

pub use error::Error;

use std::error::Error as StdError;
use std::fmt::Debug;

use bytes::Bytes;
use serde::Serialize;
use serde::de::DeserializeOwned;

/// Marker trait for codec errors
pub trait CodecError: StdError + Send + Sync + 'static {}

/// Payload encoding. Decoding must tolerate unknown fields.
pub trait Codec
where
    Self: Clone + Debug + Send + Sync + 'static,
{
    /// The error type for the codec.
    type Error: CodecError;

    /// Encode a message.
    ///
    /// # Errors
    /// Returns an error if the message cannot be represented.
    fn encode<M>(&self, message: &M) -> Result<Bytes, Self::Error>
    where
        M: Serialize + ?Sized;

    /// Decode a message.
    ///
    /// # Errors
    /// Returns an error if the payload is malformed.
    fn decode<M>(&self, payload: &[u8]) -> Result<M, Self::Error>
    where
        M: DeserializeOwned;
}

/// JSON payloads.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonCodec;

impl Codec for JsonCodec {
    type Error = Error;

    fn encode<M>(&self, message: &M) -> Result<Bytes, Error>
    where
        M: Serialize + ?Sized,
    {
        Ok(Bytes::from(serde_json::to_vec(message)?))
    }

    fn decode<M>(&self, payload: &[u8]) -> Result<M, Error>
    where
        M: DeserializeOwned,
    {
        Ok(serde_json::from_slice(payload)?)
    }
}

/// CBOR payloads.
#[derive(Clone, Copy, Debug, Default)]
pub struct CborCodec;

impl Codec for CborCodec {
    type Error = Error;

    fn encode<M>(&self, message: &M) -> Result<Bytes, Error>
    where
        M: Serialize + ?Sized,
    {
        let mut encoded = Vec::new();
        ciborium::ser::into_writer(message, &mut encoded)
            .map_err(|e| Error::CborEncode(e.to_string()))?;
        Ok(Bytes::from(encoded))
    }

    fn decode<M>(&self, payload: &[u8]) -> Result<M, Error>
    where
        M: DeserializeOwned,
    {
        ciborium::de::from_reader(payload).map_err(|e| Error::CborDecode(e.to_string()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use serde::Deserialize;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Wide {
        a: i64,
        b: String,
        extra: Vec<u8>,
    }

    #[derive(Debug, PartialEq, Deserialize)]
    struct Narrow {
        a: i64,
        #[serde(default)]
        missing: Option<String>,
    }

    fn wide() -> Wide {
        Wide {
            a: 7,
            b: "seven".to_string(),
            extra: vec![1, 2, 3],
        }
    }

    #[test]
    fn test_json_tolerates_unknown_and_missing_fields() {
        let payload = JsonCodec.encode(&wide()).unwrap();
        let narrow: Narrow = JsonCodec.decode(&payload).unwrap();
        assert_eq!(narrow, Narrow { a: 7, missing: None });
    }

    #[test]
    fn test_cbor_tolerates_unknown_and_missing_fields() {
        let payload = CborCodec.encode(&wide()).unwrap();
        let narrow: Narrow = CborCodec.decode(&payload).unwrap();
        assert_eq!(narrow, Narrow { a: 7, missing: None });
    }

    #[test]
    fn test_malformed_payload() {
        assert!(matches!(
            JsonCodec.decode::<Wide>(b"{not json"),
            Err(Error::Json(_))
        ));
        assert!(matches!(
            CborCodec.decode::<Wide>(&[0xff, 0x00]),
            Err(Error::CborDecode(_))
        ));
    }
}
