use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::path::Path;

use super::ConfigError;
use crate::domain::SourceConfig;

/// On-disk shape of the source definitions: `{ sources = [...] }`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SourcesFile {
    #[serde(default)]
    pub sources: Vec<SourceConfig>,
}

/// Loads and validates source definitions.
///
/// `.json` files are parsed as JSON, anything else as TOML. Storage
/// destinations without `max_events_per_file` get `default_max_events`.
pub fn load_sources(path: &Path, default_max_events: usize) -> Result<SourcesFile, ConfigError> {
    let content = std::fs::read_to_string(path)?;
    let is_json = path
        .extension()
        .is_some_and(|ext| ext.eq_ignore_ascii_case("json"));

    let mut raw: Value = if is_json {
        serde_json::from_str(&content)?
    } else {
        let table: toml::Value = toml::from_str(&content)?;
        serde_json::to_value(table)?
    };
    apply_storage_default(&mut raw, default_max_events);

    let file: SourcesFile = serde_json::from_value(raw)?;
    for source in &file.sources {
        source.validate()?;
    }
    Ok(file)
}

fn apply_storage_default(raw: &mut Value, default_max_events: usize) {
    let Some(sources) = raw.get_mut("sources").and_then(Value::as_array_mut) else {
        return;
    };
    let destinations = sources
        .iter_mut()
        .filter_map(|source| source.get_mut("destinations").and_then(Value::as_array_mut))
        .flatten();

    for destination in destinations {
        if destination.get("type").and_then(Value::as_str) != Some("storage") {
            continue;
        }
        if let Some(config) = destination.get_mut("config").and_then(Value::as_object_mut) {
            config
                .entry("max_events_per_file")
                .or_insert_with(|| Value::from(default_max_events));
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{DestinationKind, Protocol};

    const SOURCES_TOML: &str = r#"
[[sources]]
name = "firewall"
ip = "10.0.0.5"
port = 5514
protocol = "udp"

[[sources.destinations]]
id = "archive"
type = "storage"
config = { path = "/var/log/relay/firewall" }

[[sources.destinations]]
id = "splunk"
type = "hec"
config = { url = "https://splunk.example.com:8088/services/collector", api_key = "token" }

[[sources]]
name = "switches"
port = 5514
protocol = "UDP"
simulation_mode = true
"#;

    #[test]
    fn toml_sources_get_storage_default() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sources.toml");
        std::fs::write(&path, SOURCES_TOML).unwrap();

        let file = load_sources(&path, 1234).unwrap();
        assert_eq!(file.sources.len(), 2);

        let firewall = &file.sources[0];
        assert_eq!(firewall.protocol, Protocol::Udp);
        match &firewall.destinations[0].kind {
            DestinationKind::Storage(storage) => assert_eq!(storage.max_events_per_file, 1234),
            other => panic!("expected storage, got {other:?}"),
        }
        assert_eq!(firewall.destinations[1].kind.type_name(), "hec");

        let switches = &file.sources[1];
        assert!(switches.is_wildcard());
        assert!(switches.simulation_mode);
    }

    #[test]
    fn json_sources_keep_explicit_rotation() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sources.json");
        std::fs::write(
            &path,
            r#"{"sources":[{"name":"app","port":6514,"protocol":"tcp","destinations":[
                {"id":"disk","type":"storage","config":{"path":"/tmp/app","max_events_per_file":10}}
            ]}]}"#,
        )
        .unwrap();

        let file = load_sources(&path, 50_000).unwrap();
        match &file.sources[0].destinations[0].kind {
            DestinationKind::Storage(storage) => assert_eq!(storage.max_events_per_file, 10),
            other => panic!("expected storage, got {other:?}"),
        }
    }

    #[test]
    fn invalid_source_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sources.toml");
        std::fs::write(
            &path,
            "[[sources]]\nname = \"bad\"\nip = \"not-an-ip\"\nport = 514\nprotocol = \"udp\"\n",
        )
        .unwrap();

        assert!(matches!(
            load_sources(&path, 50_000),
            Err(ConfigError::Source(_))
        ));
    }

    #[test]
    fn missing_file_is_file_error() {
        let result = load_sources(Path::new("/nonexistent/sources.toml"), 1);
        assert!(matches!(result, Err(ConfigError::FileError(_))));
    }
}
