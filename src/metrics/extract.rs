// Nested field extraction from generic JSON documents

use serde_json::Value;

/// Walks a slash- or dot-separated path through nested objects
///
/// Returns `None` when the path is empty, a segment is missing, an
/// intermediate value is not an object, or the terminal value is not a number.
pub fn extract(document: &Value, path: &str) -> Option<f64> {
    if path.is_empty() {
        return None;
    }

    let mut current = document;
    for segment in path.split(['/', '.']) {
        current = current.as_object()?.get(segment)?;
    }

    current.as_f64()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_extract_nested_values() {
        let doc = json!({
            "writeSuccesses": 42,
            "cycleDelay": { "totalNs": 1.5e6, "minNs": 100 }
        });

        assert_eq!(extract(&doc, "writeSuccesses"), Some(42.0));
        assert_eq!(extract(&doc, "cycleDelay/totalNs"), Some(1.5e6));
        assert_eq!(extract(&doc, "cycleDelay.minNs"), Some(100.0));
    }

    #[test]
    fn test_extract_absent_values() {
        let doc = json!({
            "name": "plc",
            "cycleDelay": { "maxNs": "fast" },
            "flat": 3
        });

        assert_eq!(extract(&doc, ""), None);
        assert_eq!(extract(&doc, "missing"), None);
        assert_eq!(extract(&doc, "name"), None);
        assert_eq!(extract(&doc, "cycleDelay/maxNs"), None);
        assert_eq!(extract(&doc, "cycleDelay/minNs"), None);
        assert_eq!(extract(&doc, "flat/deeper"), None);
    }
}
