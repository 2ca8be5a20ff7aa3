use serde_json::Value;
use sha2::Digest;
use sha2::Sha256;

/// Deterministic JSON rendering: object keys sorted recursively, no
/// whitespace, array order preserved. Scope and payload hashes are computed
/// over this form so they stay stable regardless of how the input map was
/// built.
#[must_use]
pub fn canonical_json(value: &Value) -> String {
    let mut out = String::new();
    write_value(&mut out, value);
    out
}

fn write_value(out: &mut String, value: &Value) {
    match value {
        Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map.keys().collect();
            keys.sort();
            for (index, key) in keys.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_value(out, &Value::String((*key).clone()));
                out.push(':');
                if let Some(child) = map.get(*key) {
                    write_value(out, child);
                }
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (index, item) in items.iter().enumerate() {
                if index > 0 {
                    out.push(',');
                }
                write_value(out, item);
            }
            out.push(']');
        }
        // Scalars already have a single compact rendering.
        other => out.push_str(&other.to_string()),
    }
}

#[must_use]
pub fn sha256_hex(input: impl AsRef<[u8]>) -> String {
    let mut hasher = Sha256::new();
    hasher.update(input.as_ref());
    format!("{:x}", hasher.finalize())
}

/// Identity hash for idempotency: the tuple that scopes a client request.
#[must_use]
pub fn scope_hash(actor_type: &str, actor_id: &str, txn_type: &str, idempotency_key: &str) -> String {
    sha256_hex(format!(
        "{actor_type}|{actor_id}|{txn_type}|{idempotency_key}"
    ))
}

/// Conflict-detection hash over the canonical form of a request body.
#[must_use]
pub fn payload_hash(value: &Value) -> String {
    sha256_hex(canonical_json(value))
}
