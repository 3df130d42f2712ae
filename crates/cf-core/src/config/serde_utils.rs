//! Shared serde helpers for configuration
//!
//! Durations are written as plain integers: seconds for coarse settings,
//! milliseconds where sub-second values are meaningful.

/// `Duration` as a u64 count of seconds
pub mod duration_secs {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_secs())
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let secs = u64::deserialize(deserializer)?;
        Ok(Duration::from_secs(secs))
    }
}

/// `Duration` as a u64 count of milliseconds
pub mod duration_millis {
    use serde::{self, Deserialize, Deserializer, Serializer};
    use std::time::Duration;

    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_u64(duration.as_millis() as u64)
    }

    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let millis = u64::deserialize(deserializer)?;
        Ok(Duration::from_millis(millis))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde::{Deserialize, Serialize};
    use std::time::Duration;

    #[derive(Debug, PartialEq, Serialize, Deserialize)]
    struct TestConfig {
        #[serde(with = "duration_secs")]
        timeout: Duration,
        #[serde(with = "duration_millis")]
        wait: Duration,
    }

    #[test]
    fn test_duration_serialize() {
        let config = TestConfig {
            timeout: Duration::from_secs(30),
            wait: Duration::from_millis(200),
        };
        let json = serde_json::to_string(&config).unwrap();
        assert_eq!(json, r#"{"timeout":30,"wait":200}"#);
    }

    #[test]
    fn test_duration_deserialize() {
        let config: TestConfig = serde_json::from_str(r#"{"timeout":60,"wait":1500}"#).unwrap();
        assert_eq!(config.timeout, Duration::from_secs(60));
        assert_eq!(config.wait, Duration::from_millis(1500));
    }
}
