//! RS-020: BLAKE3 hashing for templates, resources and files.

use serde_json::Value;
use std::io::Read;
use std::path::Path;

const STREAM_BUF_SIZE: usize = 65536;

/// Hash a file's contents. Returns `"blake3:{hex}"`.
pub fn hash_file(path: &Path) -> Result<String, String> {
    let mut file =
        std::fs::File::open(path).map_err(|e| format!("cannot open {}: {}", path.display(), e))?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = [0u8; STREAM_BUF_SIZE];
    loop {
        let n = file
            .read(&mut buf)
            .map_err(|e| format!("read error {}: {}", path.display(), e))?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(format!("blake3:{}", hasher.finalize().to_hex()))
}

/// Hash a JSON value in canonical form (sorted keys, no whitespace).
///
/// Two values that compare equal always hash equal, whatever the key order
/// of the document they were parsed from.
pub fn hash_json(value: &Value) -> String {
    let mut hasher = blake3::Hasher::new();
    feed_canonical(&mut hasher, value);
    format!("blake3:{}", hasher.finalize().to_hex())
}

fn feed_canonical(hasher: &mut blake3::Hasher, value: &Value) {
    match value {
        Value::Object(map) => {
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            hasher.update(b"{");
            for (i, key) in keys.into_iter().enumerate() {
                if i > 0 {
                    hasher.update(b",");
                }
                hasher.update(Value::String(key.clone()).to_string().as_bytes());
                hasher.update(b":");
                feed_canonical(hasher, &map[key]);
            }
            hasher.update(b"}");
        }
        Value::Array(items) => {
            hasher.update(b"[");
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    hasher.update(b",");
                }
                feed_canonical(hasher, item);
            }
            hasher.update(b"]");
        }
        scalar => {
            hasher.update(scalar.to_string().as_bytes());
        }
    }
}

/// Compute a composite hash from multiple component hashes.
pub fn composite_hash(components: &[&str]) -> String {
    let mut hasher = blake3::Hasher::new();
    for c in components {
        hasher.update(c.as_bytes());
        hasher.update(b"\0");
    }
    format!("blake3:{}", hasher.finalize().to_hex())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_rs020_hash_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("Net.template.json");
        std::fs::write(&path, "{}").unwrap();
        let h = hash_file(&path).unwrap();
        assert!(h.starts_with("blake3:"));
        assert_eq!(h.len(), 7 + 64); // "blake3:" + 64 hex chars
        assert_eq!(h, format!("blake3:{}", blake3::hash(b"{}").to_hex()));
    }

    #[test]
    fn test_rs020_compact_file_matches_canonical_json() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("t.json");
        std::fs::write(&path, r#"{"a":[1,"x"],"b":null}"#).unwrap();
        let value: Value = serde_json::from_str(r#"{"b": null, "a": [1, "x"]}"#).unwrap();
        assert_eq!(hash_file(&path).unwrap(), hash_json(&value));
    }

    #[test]
    fn test_rs020_hash_json_key_order_independent() {
        let a: Value = serde_json::from_str(r#"{"b": 1, "a": [true, null, "x"]}"#).unwrap();
        let b: Value = serde_json::from_str(r#"{"a": [true, null, "x"], "b": 1}"#).unwrap();
        assert_eq!(hash_json(&a), hash_json(&b));
    }

    #[test]
    fn test_rs020_hash_json_sensitive_to_values() {
        let a = json!({"Port": 80});
        let b = json!({"Port": 81});
        let c = json!({"Port": "80"});
        assert_ne!(hash_json(&a), hash_json(&b));
        assert_ne!(hash_json(&a), hash_json(&c));
        // Array order is significant
        assert_ne!(hash_json(&json!([1, 2])), hash_json(&json!([2, 1])));
    }

    #[test]
    fn test_rs020_composite_hash() {
        let h = composite_hash(&["blake3:aaa", "blake3:bbb"]);
        assert!(h.starts_with("blake3:"));
        // Different inputs → different hash
        let h2 = composite_hash(&["blake3:bbb", "blake3:aaa"]);
        assert_ne!(h, h2);
    }

    #[test]
    fn test_rs020_hash_file_not_found() {
        let result = hash_file(Path::new("/nonexistent/file.json"));
        assert!(result.is_err());
    }
}
