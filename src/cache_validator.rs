use serde::{de::DeserializeOwned, Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Cached payload plus the SHA-256 of its JSON text.
///
/// Serpro answers are cached for a day; an entry whose checksum no longer
/// matches is treated as a miss and the document is fetched again.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ValidatedCacheEntry {
    pub data: String,
    /// Hex-encoded SHA-256 of `data`.
    pub checksum: String,
}

impl ValidatedCacheEntry {
    pub fn new(data: String) -> Self {
        let checksum = checksum(&data);
        Self { data, checksum }
    }

    pub fn is_valid(&self) -> bool {
        checksum(&self.data) == self.checksum
    }

    /// Serializes `value` and wraps it. Returns None if it does not serialize.
    pub fn seal<T: Serialize>(value: &T) -> Option<String> {
        let data = serde_json::to_string(value).ok()?;
        serde_json::to_string(&Self::new(data)).ok()
    }

    /// Unwraps a sealed entry, checking integrity before decoding.
    pub fn open<T: DeserializeOwned>(sealed: &str) -> Option<T> {
        let entry: ValidatedCacheEntry = serde_json::from_str(sealed).ok()?;

        if !entry.is_valid() {
            tracing::warn!(
                "Cache entry rejected: checksum mismatch (expected {}, {} bytes)",
                entry.checksum,
                entry.data.len()
            );
            return None;
        }

        serde_json::from_str(&entry.data).ok()
    }
}

fn checksum(data: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(data.as_bytes());
    hex::encode(hasher.finalize())
}

/// Cache key of a document lookup, e.g. `cnpj:11222333000181`.
pub fn lookup_key(tipo: &str, documento: &str) -> String {
    format!("{}:{}", tipo, documento)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_seal_and_open() {
        let value = json!({"ni": "11222333000181", "nomeEmpresarial": "SOUZA DOCES LTDA"});
        let sealed = ValidatedCacheEntry::seal(&value).unwrap();
        let opened: serde_json::Value = ValidatedCacheEntry::open(&sealed).unwrap();
        assert_eq!(opened, value);
    }

    #[test]
    fn test_tampered_entry_is_a_miss() {
        let sealed = ValidatedCacheEntry::seal(&json!({"situacao": "ATIVA"})).unwrap();
        let tampered = sealed.replace("ATIVA", "BAIXADA");
        assert!(ValidatedCacheEntry::open::<serde_json::Value>(&tampered).is_none());
    }

    #[test]
    fn test_garbage_is_a_miss() {
        assert!(ValidatedCacheEntry::open::<serde_json::Value>("not json").is_none());
    }

    #[test]
    fn test_lookup_key() {
        assert_eq!(lookup_key("cpf", "52998224725"), "cpf:52998224725");
    }
}
