//! Decoding of the opaque backend configuration passed to `init`.

use serde::de::DeserializeOwned;

use crate::error::{HypervisorError, Result};

/// Decode backend configuration bytes.
///
/// The bytes may be YAML or JSON. Empty (or whitespace-only) input yields
/// `None` so the backend keeps its current settings.
pub fn parse_backend_config<T: DeserializeOwned>(bytes: &[u8]) -> Result<Option<T>> {
    if bytes.iter().all(u8::is_ascii_whitespace) {
        return Ok(None);
    }

    serde_yaml::from_slice(bytes)
        .map(Some)
        .map_err(|e| HypervisorError::InvalidConfig(e.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::Deserialize;

    #[derive(Debug, Deserialize, Default, PartialEq)]
    #[serde(default)]
    struct Sample {
        working_directory: String,
        max_machines: usize,
    }

    #[test]
    fn test_empty_keeps_defaults() {
        assert_eq!(parse_backend_config::<Sample>(b"").unwrap(), None);
        assert_eq!(parse_backend_config::<Sample>(b"  \n").unwrap(), None);
    }

    #[test]
    fn test_json_and_yaml() {
        let json: Sample = parse_backend_config(br#"{"max_machines": 3}"#).unwrap().unwrap();
        assert_eq!(json.max_machines, 3);

        let yaml: Sample = parse_backend_config(b"working_directory: /var/nesting\n")
            .unwrap()
            .unwrap();
        assert_eq!(yaml.working_directory, "/var/nesting");
    }

    #[test]
    fn test_garbage_is_invalid_config() {
        let err = parse_backend_config::<Sample>(b"max_machines: [").unwrap_err();
        assert!(matches!(err, HypervisorError::InvalidConfig(_)));
    }
}
