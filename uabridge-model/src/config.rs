use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::{
    fs,
    path::{Path, PathBuf},
    sync::{Arc, RwLock},
};
use uabridge_error::{BridgeError, BridgeResult};

use crate::view::ConfigView;

/// Root of the configuration document.
///
/// `nodes` and unrecognized option fields are owned by the external editing
/// layer; they are carried opaquely so a load/save cycle never loses them.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigDocument {
    #[serde(default)]
    pub driver: DriverSettings,
    #[serde(default)]
    pub options_scheme: OptionsScheme,
    #[serde(default)]
    pub nodes: Value,
    #[serde(default)]
    pub devices: IndexMap<String, Device>,
}

/// Supervisor link settings from the `driver` section.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DriverSettings {
    #[serde(default = "DriverSettings::default_uid")]
    pub uid: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<String>,
    #[serde(default = "DriverSettings::default_host")]
    pub host: String,
    #[serde(default = "DriverSettings::default_port")]
    pub port: u16,
    #[serde(default = "DriverSettings::default_version")]
    pub version: String,
    #[serde(default)]
    pub tls: TlsSettings,
    #[serde(default = "DriverSettings::default_log_level")]
    pub log_level: String,
}

impl DriverSettings {
    fn default_uid() -> String {
        "opcua-bridge".to_string()
    }

    fn default_host() -> String {
        "127.0.0.1".to_string()
    }

    fn default_port() -> u16 {
        20_504
    }

    fn default_version() -> String {
        env!("CARGO_PKG_VERSION").to_string()
    }

    fn default_log_level() -> String {
        "info".to_string()
    }
}

impl Default for DriverSettings {
    fn default() -> Self {
        Self {
            uid: Self::default_uid(),
            password: None,
            host: Self::default_host(),
            port: Self::default_port(),
            version: Self::default_version(),
            tls: TlsSettings::default(),
            log_level: Self::default_log_level(),
        }
    }
}

/// Optional TLS wrapping of the supervisor socket.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TlsSettings {
    #[serde(default)]
    pub enabled: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub ca_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cert_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_file: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub server_name: Option<String>,
}

/// Option metadata declared by the editing layer. The engine only consults
/// `restartOnChange`; everything else passes through untouched.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionsScheme {
    #[serde(default)]
    pub devices: IndexMap<String, OptionScheme>,
    #[serde(default)]
    pub tags: IndexMap<String, OptionScheme>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionScheme {
    #[serde(default)]
    pub restart_on_change: bool,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// A single configurable option: the live value plus whatever metadata the
/// editing layer stores alongside it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OptionValue {
    #[serde(default)]
    pub current_value: Value,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

impl OptionValue {
    pub fn of(value: impl Into<Value>) -> Self {
        Self {
            current_value: value.into(),
            extra: serde_json::Map::new(),
        }
    }

    pub fn as_str(&self) -> Option<&str> {
        self.current_value.as_str()
    }

    pub fn as_bool(&self) -> Option<bool> {
        self.current_value.as_bool()
    }

    pub fn as_u64(&self) -> Option<u64> {
        self.current_value.as_u64()
    }

    pub fn as_i64(&self) -> Option<i64> {
        self.current_value.as_i64()
    }
}

/// One logical OPC UA device as configured by the supervisor.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Device {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub options: DeviceOptions,
    /// Insertion-ordered `tagUid -> Tag`.
    #[serde(default)]
    pub tags: IndexMap<String, Tag>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub endpoint_url: Option<OptionValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_mode: Option<OptionValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub security_policy: Option<OptionValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub certificate_file: Option<OptionValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub private_key_file: Option<OptionValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub anonymous: Option<OptionValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_name: Option<OptionValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub password: Option<OptionValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timeout: Option<OptionValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub browse_trigger: Option<OptionValue>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// Supervisor-level tag type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TagKind {
    Bool,
    Int,
    Float,
    String,
    Datetime,
}

impl TagKind {
    /// Supervisor type for an OPC UA DataType numeric code, used when the
    /// browser populates tags from discovered variables.
    pub fn from_data_type_code(code: u32) -> Self {
        match code {
            1 => TagKind::Bool,
            2..=9 => TagKind::Int,
            10 | 11 => TagKind::Float,
            13 => TagKind::Datetime,
            _ => TagKind::String,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Tag {
    pub name: String,
    #[serde(rename = "type")]
    pub kind: TagKind,
    #[serde(default = "default_true")]
    pub read: bool,
    #[serde(default = "default_true")]
    pub write: bool,
    #[serde(default)]
    pub address: Value,
    #[serde(default)]
    pub options: TagOptions,
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TagOptions {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_id: Option<OptionValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_type: Option<OptionValue>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub array_index: Option<OptionValue>,
    #[serde(flatten)]
    pub extra: serde_json::Map<String, Value>,
}

/// A variable discovered by the browser, in emission order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiscoveredTag {
    pub name: String,
    pub node_id: String,
    pub node_type: u32,
    pub array_index: i64,
}

impl Device {
    /// Merge a completed browse into `tags`.
    ///
    /// Existing entries are matched by tag name and keep their uid and map
    /// position; unmatched discoveries are appended under `max(uid) + 1`.
    /// Every matched or created entry gets its node options and supervisor
    /// type overwritten. Previously existing tags that matched nothing are
    /// removed, and `browseTrigger` falls back to `Stop`.
    pub fn apply_browse(&mut self, discovered: &[DiscoveredTag]) {
        let mut matched: Vec<String> = Vec::with_capacity(discovered.len());
        let mut next_uid = self
            .tags
            .keys()
            .filter_map(|uid| uid.parse::<i64>().ok())
            .max()
            .unwrap_or(0)
            + 1;

        for found in discovered {
            let uid = match self
                .tags
                .iter()
                .find(|(_, tag)| tag.name == found.name)
                .map(|(uid, _)| uid.clone())
            {
                Some(uid) => uid,
                None => {
                    let uid = next_uid.to_string();
                    next_uid += 1;
                    self.tags.insert(
                        uid.clone(),
                        Tag {
                            name: found.name.clone(),
                            kind: TagKind::from_data_type_code(found.node_type),
                            read: true,
                            write: true,
                            address: Value::from(uid.clone()),
                            options: TagOptions::default(),
                        },
                    );
                    uid
                }
            };

            let tag = self.tags.get_mut(&uid).expect("uid inserted above");
            tag.kind = TagKind::from_data_type_code(found.node_type);
            tag.options.node_id = Some(OptionValue::of(found.node_id.clone()));
            tag.options.node_type = Some(OptionValue::of(found.node_type));
            tag.options.array_index = Some(OptionValue::of(found.array_index));
            matched.push(uid);
        }

        self.tags.retain(|uid, _| matched.iter().any(|m| m == uid));
        self.options.browse_trigger = Some(OptionValue::of("Stop"));
    }
}

/// Shared, file-backed configuration document.
///
/// Cloning the store clones the handle, not the document.
#[derive(Debug, Clone)]
pub struct ConfigStore {
    path: PathBuf,
    doc: Arc<RwLock<ConfigDocument>>,
}

impl ConfigStore {
    pub fn load(path: impl AsRef<Path>) -> BridgeResult<Self> {
        let path = path.as_ref().to_path_buf();
        let raw = fs::read_to_string(&path)?;
        let doc: ConfigDocument = serde_json::from_str(&raw)
            .map_err(|e| BridgeError::ConfigError(format!("{}: {e}", path.display())))?;
        Ok(Self {
            path,
            doc: Arc::new(RwLock::new(doc)),
        })
    }

    /// Build a store around an already-parsed document (tests, embedding).
    pub fn from_document(path: impl AsRef<Path>, doc: ConfigDocument) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
            doc: Arc::new(RwLock::new(doc)),
        }
    }

    pub fn save(&self) -> BridgeResult<()> {
        let rendered = {
            let doc = self.doc.read().expect("config lock poisoned");
            serde_json::to_string_pretty(&*doc)?
        };
        fs::write(&self.path, rendered)?;
        Ok(())
    }

    pub fn view(&self) -> ConfigView {
        ConfigView::new(Arc::clone(&self.doc))
    }

    pub fn driver_settings(&self) -> DriverSettings {
        self.doc.read().expect("config lock poisoned").driver.clone()
    }

    /// Run a mutation against the document under the write lock.
    pub fn update<R>(&self, f: impl FnOnce(&mut ConfigDocument) -> R) -> R {
        let mut doc = self.doc.write().expect("config lock poisoned");
        f(&mut doc)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_doc() -> ConfigDocument {
        serde_json::from_value(serde_json::json!({
            "driver": {"uid": "drv1", "host": "10.0.0.5", "port": 9100},
            "optionsScheme": {
                "devices": {
                    "endpointUrl": {"restartOnChange": true, "type": "string"},
                    "browseTrigger": {"restartOnChange": false}
                },
                "tags": {
                    "nodeId": {"restartOnChange": true}
                }
            },
            "nodes": {"1": {"name": "plant"}},
            "devices": {
                "dev-a": {
                    "name": "Boiler",
                    "options": {
                        "endpointUrl": {"currentValue": "opc.tcp://boiler:4840"},
                        "browseTrigger": {"currentValue": "Start"}
                    },
                    "tags": {
                        "1": {
                            "name": "temp",
                            "type": "float",
                            "read": true,
                            "write": false,
                            "address": 1,
                            "options": {
                                "nodeId": {"currentValue": "ns=2;s=Temp"},
                                "nodeType": {"currentValue": 11},
                                "arrayIndex": {"currentValue": -1}
                            }
                        },
                        "4": {
                            "name": "obsolete",
                            "type": "int",
                            "options": {"nodeId": {"currentValue": "ns=2;s=Gone"}}
                        }
                    }
                }
            }
        }))
        .expect("sample document parses")
    }

    fn discovered() -> Vec<DiscoveredTag> {
        vec![
            DiscoveredTag {
                name: "temp".into(),
                node_id: "ns=2;s=Temp".into(),
                node_type: 11,
                array_index: -1,
            },
            DiscoveredTag {
                name: "Plant/Levels/_value[0]".into(),
                node_id: "ns=2;s=Levels".into(),
                node_type: 6,
                array_index: 0,
            },
        ]
    }

    #[test]
    fn browse_merge_reuses_uid_by_name() {
        let mut doc = sample_doc();
        let device = doc.devices.get_mut("dev-a").unwrap();
        device.apply_browse(&discovered());

        let temp = device.tags.get("1").expect("existing uid kept");
        assert_eq!(temp.name, "temp");
        // read/write flags are preserved for reused entries
        assert!(!temp.write);
        assert_eq!(
            temp.options.node_id.as_ref().unwrap().as_str(),
            Some("ns=2;s=Temp")
        );
    }

    #[test]
    fn browse_merge_allocates_next_uid_and_drops_unmatched() {
        let mut doc = sample_doc();
        let device = doc.devices.get_mut("dev-a").unwrap();
        device.apply_browse(&discovered());

        assert!(device.tags.get("4").is_none(), "unmatched tag removed");
        let fresh = device.tags.get("5").expect("max uid + 1 allocated");
        assert_eq!(fresh.name, "Plant/Levels/_value[0]");
        assert_eq!(fresh.kind, TagKind::Int);
        assert!(fresh.read && fresh.write);
        assert_eq!(fresh.address, Value::from("5"));
        assert_eq!(
            fresh.options.array_index.as_ref().unwrap().as_i64(),
            Some(0)
        );
        assert_eq!(
            device
                .options
                .browse_trigger
                .as_ref()
                .unwrap()
                .as_str(),
            Some("Stop")
        );
    }

    #[test]
    fn browse_merge_is_idempotent_on_stable_topology() {
        let mut doc = sample_doc();
        let device = doc.devices.get_mut("dev-a").unwrap();
        device.apply_browse(&discovered());
        let first = serde_json::to_value(&*device).unwrap();
        device.apply_browse(&discovered());
        let second = serde_json::to_value(&*device).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn store_round_trip_preserves_opaque_sections() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("bridge.json");
        let doc = sample_doc();
        let store = ConfigStore::from_document(&path, doc);
        store.save().unwrap();

        let reloaded = ConfigStore::load(&path).unwrap();
        let nodes = reloaded.update(|doc| doc.nodes.clone());
        assert_eq!(nodes["1"]["name"], "plant");
        let settings = reloaded.driver_settings();
        assert_eq!(settings.uid, "drv1");
        assert_eq!(settings.port, 9100);
    }

    #[test]
    fn data_type_codes_map_to_supervisor_kinds() {
        assert_eq!(TagKind::from_data_type_code(1), TagKind::Bool);
        assert_eq!(TagKind::from_data_type_code(8), TagKind::Int);
        assert_eq!(TagKind::from_data_type_code(11), TagKind::Float);
        assert_eq!(TagKind::from_data_type_code(12), TagKind::String);
        assert_eq!(TagKind::from_data_type_code(13), TagKind::Datetime);
        assert_eq!(TagKind::from_data_type_code(21), TagKind::String);
    }
}
