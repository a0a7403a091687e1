//! Serde adapters shared by the wire formats and the config files.

use {
    base64::Engine as _,
    serde::{de, Deserialize, Deserializer, Serializer},
    serde_with::{DeserializeAs, SerializeAs},
};

/// Serialize and deserialize [`alloy::primitives::U256`] as a decimal string.
#[derive(Debug)]
pub struct U256;

impl<'de> DeserializeAs<'de, alloy::primitives::U256> for U256 {
    fn deserialize_as<D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<alloy::primitives::U256, D::Error> {
        let value = String::deserialize(deserializer)?;
        value.parse().map_err(de::Error::custom)
    }
}

impl SerializeAs<alloy::primitives::U256> for U256 {
    fn serialize_as<S: Serializer>(
        value: &alloy::primitives::U256,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&value.to_string())
    }
}

/// Serialize and deserialize binary data as standard base64.
#[derive(Debug)]
pub struct Base64;

impl<'de> DeserializeAs<'de, Vec<u8>> for Base64 {
    fn deserialize_as<D: Deserializer<'de>>(deserializer: D) -> Result<Vec<u8>, D::Error> {
        let value = String::deserialize(deserializer)?;
        base64::engine::general_purpose::STANDARD
            .decode(value)
            .map_err(de::Error::custom)
    }
}

impl SerializeAs<Vec<u8>> for Base64 {
    fn serialize_as<S: Serializer>(value: &Vec<u8>, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(value))
    }
}

impl<'de> DeserializeAs<'de, [u8; 32]> for Base64 {
    fn deserialize_as<D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let value = String::deserialize(deserializer)?;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(value)
            .map_err(de::Error::custom)?;
        bytes
            .try_into()
            .map_err(|bytes: Vec<u8>| de::Error::invalid_length(bytes.len(), &"32 bytes"))
    }
}

impl SerializeAs<[u8; 32]> for Base64 {
    fn serialize_as<S: Serializer>(value: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&base64::engine::general_purpose::STANDARD.encode(value))
    }
}

#[cfg(test)]
mod tests {
    use {
        super::*,
        serde::Serialize,
        serde_with::serde_as,
    };

    #[serde_as]
    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Record {
        #[serde_as(as = "U256")]
        amount: alloy::primitives::U256,
        #[serde_as(as = "Base64")]
        data: Vec<u8>,
    }

    #[test]
    fn u256_as_decimal_string() {
        let record = Record {
            amount: alloy::primitives::U256::from(1000_u64),
            data: vec![1, 2, 3],
        };
        let json = serde_json::to_value(&record).unwrap();
        assert_eq!(json["amount"], "1000");
        assert_eq!(json["data"], "AQID");
        assert_eq!(serde_json::from_value::<Record>(json).unwrap(), record);
    }
}
