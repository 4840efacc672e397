use std::collections::HashMap;

/// The four recognized keys of the appliance env file.
pub const AGENTCORE_TOKEN: &str = "AGENTCORE_TOKEN";
pub const AGENT_TOKEN: &str = "AGENT_TOKEN";
pub const AGENTCORE_ZONE_ID: &str = "AGENTCORE_ZONE_ID";
pub const SOCAT_TARGET_ADDR: &str = "SOCAT_TARGET_ADDR";

/// Parses `KEY=value` lines; blank lines and `#` comments are skipped, and a
/// layer of single or double quotes around the value is stripped.
pub fn parse(content: &str) -> HashMap<String, String> {
    let mut values = HashMap::new();
    for line in content.lines() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        if let Some((key, value)) = line.split_once('=') {
            values.insert(key.trim().to_string(), unquote(value.trim()).to_string());
        }
    }
    values
}

pub fn serialize(pairs: &[(&str, String)]) -> String {
    let mut out = String::new();
    for (key, value) in pairs {
        out.push_str(key);
        out.push('=');
        out.push_str(value);
        out.push('\n');
    }
    out
}

fn unquote(value: &str) -> &str {
    let bytes = value.as_bytes();
    if bytes.len() >= 2 {
        let (first, last) = (bytes[0], bytes[bytes.len() - 1]);
        if first == last && (first == b'"' || first == b'\'') {
            return &value[1..value.len() - 1];
        }
    }
    value
}
