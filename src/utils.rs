//! Serialization helpers shared by wire messages and stored records

/// Serde adapter storing a [`bitcoin::Transaction`] as its consensus encoding
///
/// Use with `#[serde(with = "crate::utils::consensus_tx")]`.
pub mod consensus_tx {
    use bitcoin::consensus::encode;
    use bitcoin::Transaction;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    /// Serializes `tx` as consensus bytes
    pub fn serialize<S: Serializer>(tx: &Transaction, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_bytes(&encode::serialize(tx))
    }

    /// Deserializes consensus bytes into a transaction
    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Transaction, D::Error> {
        let bytes: Vec<u8> = Deserialize::deserialize(deserializer)?;
        encode::deserialize(&bytes).map_err(D::Error::custom)
    }
}

/// Serde adapter for an optional consensus-encoded transaction
pub mod consensus_tx_opt {
    use bitcoin::consensus::encode;
    use bitcoin::Transaction;
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    /// Serializes `tx` as optional consensus bytes
    pub fn serialize<S: Serializer>(
        tx: &Option<Transaction>,
        serializer: S,
    ) -> Result<S::Ok, S::Error> {
        tx.as_ref().map(encode::serialize).serialize(serializer)
    }

    /// Deserializes optional consensus bytes into a transaction
    pub fn deserialize<'de, D: Deserializer<'de>>(
        deserializer: D,
    ) -> Result<Option<Transaction>, D::Error> {
        let bytes: Option<Vec<u8>> = Deserialize::deserialize(deserializer)?;
        bytes.map(|b| encode::deserialize(&b).map_err(D::Error::custom)).transpose()
    }
}

#[cfg(test)]
mod tests {
    use bitcoin::absolute::LockTime;
    use bitcoin::transaction::Version;
    use bitcoin::{Amount, ScriptBuf, Transaction, TxOut};
    use serde::{Deserialize, Serialize};

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct Wrapper {
        #[serde(with = "super::consensus_tx")]
        tx: Transaction,
        #[serde(with = "super::consensus_tx_opt")]
        maybe: Option<Transaction>,
    }

    fn sample_tx(value: u64) -> Transaction {
        Transaction {
            version: Version::TWO,
            lock_time: LockTime::ZERO,
            input: vec![],
            output: vec![TxOut { value: Amount::from_sat(value), script_pubkey: ScriptBuf::new() }],
        }
    }

    #[test]
    fn test_postcard_preserves_transactions() {
        let wrapper = Wrapper { tx: sample_tx(5), maybe: Some(sample_tx(6)) };
        let bytes = postcard::to_allocvec(&wrapper).expect("serializes");
        let decoded: Wrapper = postcard::from_bytes(&bytes).expect("deserializes");
        assert_eq!(decoded, wrapper);

        let empty = Wrapper { tx: sample_tx(5), maybe: None };
        let bytes = postcard::to_allocvec(&empty).expect("serializes");
        let decoded: Wrapper = postcard::from_bytes(&bytes).expect("deserializes");
        assert_eq!(decoded.maybe, None);
    }
}
