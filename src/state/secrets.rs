use serde_yaml::Value;

use super::error::ValidationError;

const SECRET_KEYS: [&str; 2] = ["password", "secret"];

fn secret_key(key: &Value) -> Option<&str> {
    key.as_str().filter(|k| SECRET_KEYS.contains(k))
}

fn present(value: &Value) -> bool {
    match value {
        Value::Null => false,
        Value::Bool(b) => *b,
        Value::String(s) => !s.is_empty(),
        _ => true,
    }
}

/// Replaces every `password`/`secret` value, at any depth, by a boolean
/// telling whether a value is stored. Sequences are searched for nested
/// mappings; scalars other than secrets pass through untouched.
pub fn replace_secrets(config: &mut Value) {
    let Some(map) = config.as_mapping_mut() else {
        return;
    };
    for (key, value) in map.iter_mut() {
        if secret_key(key).is_some() {
            *value = Value::Bool(present(value));
        } else {
            match value {
                Value::Sequence(items) => {
                    for item in items {
                        replace_secrets(item);
                    }
                }
                Value::Mapping(_) => replace_secrets(value),
                _ => {}
            }
        }
    }
}

/// Restores boolean secrets from the currently stored document: `true`
/// requires a stored value, `false` takes the stored value when there is one
/// and drops the key otherwise, a string is accepted as a fresh secret.
/// Sequences of mappings are matched positionally against `current`.
pub fn revert_secrets(config: &mut Value, current: &Value) -> Result<(), ValidationError> {
    let Some(map) = config.as_mapping_mut() else {
        return Ok(());
    };

    let mut dropped: Vec<Value> = Vec::new();
    for (key, value) in map.iter_mut() {
        if let Some(name) = secret_key(key) {
            match value {
                Value::Bool(keep) => {
                    let stored = current
                        .get(name)
                        .and_then(Value::as_str)
                        .filter(|s| !s.is_empty());
                    match stored {
                        Some(stored) => *value = Value::String(stored.to_string()),
                        None if *keep => {
                            return Err(ValidationError::new(format!(
                                "got a boolean {name} but missing in current state"
                            )))
                        }
                        None => dropped.push(key.clone()),
                    }
                }
                Value::String(_) => {}
                _ => {
                    return Err(ValidationError::new(format!(
                        "{name} must be boolean or string"
                    )))
                }
            }
        } else {
            let orig = key.as_str().and_then(|name| current.get(name));
            match value {
                Value::Sequence(items) => {
                    for (idx, item) in items.iter_mut().enumerate() {
                        if item.is_mapping() {
                            match orig.and_then(Value::as_sequence).and_then(|s| s.get(idx)) {
                                Some(entry) => revert_secrets(item, entry)?,
                                None => revert_secrets(item, &Value::Null)?,
                            }
                        }
                    }
                }
                Value::Mapping(_) => match orig {
                    Some(entry) => revert_secrets(value, entry)?,
                    None => revert_secrets(value, &Value::Null)?,
                },
                _ => {}
            }
        }
    }
    for key in dropped {
        map.remove(&key);
    }
    Ok(())
}
