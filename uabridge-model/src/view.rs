use crate::config::{ConfigDocument, Device, Tag, TagKind};
use std::{
    str::FromStr,
    sync::{Arc, RwLock},
};
use uabridge_error::{BridgeError, BridgeResult};

/// Declared message security mode names.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecurityModeName {
    #[default]
    None,
    Sign,
    SignAndEncrypt,
}

impl FromStr for SecurityModeName {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "None" => Ok(SecurityModeName::None),
            "Sign" => Ok(SecurityModeName::Sign),
            "SignAndEncrypt" => Ok(SecurityModeName::SignAndEncrypt),
            other => Err(BridgeError::ConfigError(format!(
                "unknown security mode: {other}"
            ))),
        }
    }
}

/// Declared security policy names, including the legacy spellings older
/// supervisors still emit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecurityPolicyName {
    #[default]
    None,
    Basic128,
    Basic128Rsa15,
    Basic192,
    Basic192Rsa15,
    Basic256,
    Basic256Rsa15,
    Basic256Sha256,
    Aes128Sha256RsaOaep,
    Aes256Sha256RsaPss,
}

impl FromStr for SecurityPolicyName {
    type Err = BridgeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "None" => Ok(SecurityPolicyName::None),
            "Basic128" => Ok(SecurityPolicyName::Basic128),
            "Basic128Rsa15" => Ok(SecurityPolicyName::Basic128Rsa15),
            "Basic192" => Ok(SecurityPolicyName::Basic192),
            "Basic192Rsa15" => Ok(SecurityPolicyName::Basic192Rsa15),
            "Basic256" => Ok(SecurityPolicyName::Basic256),
            "Basic256Rsa15" => Ok(SecurityPolicyName::Basic256Rsa15),
            "Basic256Sha256" => Ok(SecurityPolicyName::Basic256Sha256),
            "Aes128_Sha256_RsaOaep" => Ok(SecurityPolicyName::Aes128Sha256RsaOaep),
            "Aes256_Sha256_RsaPss" => Ok(SecurityPolicyName::Aes256Sha256RsaPss),
            other => Err(BridgeError::ConfigError(format!(
                "unknown security policy: {other}"
            ))),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum BrowseTrigger {
    Start,
    #[default]
    Stop,
}

/// Snapshot of one device's connection-relevant options.
#[derive(Debug, Clone)]
pub struct DeviceSettings {
    pub endpoint_url: Option<String>,
    pub security_mode: SecurityModeName,
    pub security_policy: SecurityPolicyName,
    pub certificate_file: Option<String>,
    pub private_key_file: Option<String>,
    pub anonymous: bool,
    pub user_name: Option<String>,
    pub password: Option<String>,
    pub timeout_ms: u64,
    pub browse_trigger: BrowseTrigger,
}

impl DeviceSettings {
    pub const DEFAULT_TIMEOUT_MS: u64 = 10_000;

    fn from_device(device: &Device) -> Self {
        let opts = &device.options;
        let security_mode = opts
            .security_mode
            .as_ref()
            .and_then(|o| o.as_str())
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();
        let security_policy = opts
            .security_policy
            .as_ref()
            .and_then(|o| o.as_str())
            .and_then(|s| s.parse().ok())
            .unwrap_or_default();
        let browse_trigger = match opts.browse_trigger.as_ref().and_then(|o| o.as_str()) {
            Some("Start") => BrowseTrigger::Start,
            _ => BrowseTrigger::Stop,
        };
        Self {
            endpoint_url: opts
                .endpoint_url
                .as_ref()
                .and_then(|o| o.as_str())
                .map(str::to_string),
            security_mode,
            security_policy,
            certificate_file: opts
                .certificate_file
                .as_ref()
                .and_then(|o| o.as_str())
                .map(str::to_string),
            private_key_file: opts
                .private_key_file
                .as_ref()
                .and_then(|o| o.as_str())
                .map(str::to_string),
            anonymous: opts
                .anonymous
                .as_ref()
                .and_then(|o| o.as_bool())
                .unwrap_or(true),
            user_name: opts
                .user_name
                .as_ref()
                .and_then(|o| o.as_str())
                .map(str::to_string),
            password: opts
                .password
                .as_ref()
                .and_then(|o| o.as_str())
                .map(str::to_string),
            timeout_ms: opts
                .timeout
                .as_ref()
                .and_then(|o| o.as_u64())
                .unwrap_or(Self::DEFAULT_TIMEOUT_MS),
            browse_trigger,
        }
    }
}

/// Runtime snapshot of one tag's request-relevant configuration.
#[derive(Debug, Clone, PartialEq)]
pub struct TagConfig {
    pub name: String,
    pub kind: TagKind,
    pub read: bool,
    pub write: bool,
    pub node_id: String,
    pub node_type: u32,
    pub array_index: i64,
}

impl TagConfig {
    pub fn from_tag(tag: &Tag) -> BridgeResult<Self> {
        let node_id = tag
            .options
            .node_id
            .as_ref()
            .and_then(|o| o.as_str())
            .filter(|s| !s.is_empty())
            .ok_or_else(|| {
                BridgeError::ConfigError(format!("tag {} has no nodeId option", tag.name))
            })?
            .to_string();
        let node_type = tag
            .options
            .node_type
            .as_ref()
            .and_then(|o| o.as_u64())
            .ok_or_else(|| {
                BridgeError::ConfigError(format!("tag {} has no nodeType option", tag.name))
            })? as u32;
        let array_index = tag
            .options
            .array_index
            .as_ref()
            .and_then(|o| o.as_i64())
            .unwrap_or(-1);
        Ok(Self {
            name: tag.name.clone(),
            kind: tag.kind,
            read: tag.read,
            write: tag.write,
            node_id,
            node_type,
            array_index,
        })
    }
}

/// Read-only projection over the shared configuration document.
///
/// Every accessor returns an owned snapshot so no lock is held across a
/// suspension point. Missing devices and missing options come back as `None`;
/// the engine maps a missing endpoint URL to `DeviceIdNotFound`.
#[derive(Debug, Clone)]
pub struct ConfigView {
    doc: Arc<RwLock<ConfigDocument>>,
}

impl ConfigView {
    pub(crate) fn new(doc: Arc<RwLock<ConfigDocument>>) -> Self {
        Self { doc }
    }

    pub fn endpoint_url(&self, device_uid: &str) -> Option<String> {
        self.with_device(device_uid, |d| {
            d.options
                .endpoint_url
                .as_ref()
                .and_then(|o| o.as_str())
                .map(str::to_string)
        })
        .flatten()
    }

    pub fn device_settings(&self, device_uid: &str) -> Option<DeviceSettings> {
        self.with_device(device_uid, DeviceSettings::from_device)
    }

    pub fn find_tag(&self, device_uid: &str, tag_name: &str) -> Option<Tag> {
        self.with_device(device_uid, |d| {
            d.tags.values().find(|t| t.name == tag_name).cloned()
        })
        .flatten()
    }

    /// First tag listed for the device, used to seed a background connect.
    pub fn first_tag(&self, device_uid: &str) -> Option<Tag> {
        self.with_device(device_uid, |d| d.tags.values().next().cloned())
            .flatten()
    }

    pub fn device_exists(&self, device_uid: &str) -> bool {
        self.with_device(device_uid, |_| ()).is_some()
    }

    pub fn restart_on_change_device_option(&self, option: &str) -> bool {
        let doc = self.doc.read().expect("config lock poisoned");
        doc.options_scheme
            .devices
            .get(option)
            .map(|s| s.restart_on_change)
            .unwrap_or(false)
    }

    pub fn restart_on_change_tag_option(&self, option: &str) -> bool {
        let doc = self.doc.read().expect("config lock poisoned");
        doc.options_scheme
            .tags
            .get(option)
            .map(|s| s.restart_on_change)
            .unwrap_or(false)
    }

    fn with_device<R>(&self, device_uid: &str, f: impl FnOnce(&Device) -> R) -> Option<R> {
        let doc = self.doc.read().expect("config lock poisoned");
        doc.devices.get(device_uid).map(f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigStore;

    fn store() -> ConfigStore {
        let doc: ConfigDocument = serde_json::from_value(serde_json::json!({
            "optionsScheme": {
                "devices": {"endpointUrl": {"restartOnChange": true}},
                "tags": {"nodeId": {"restartOnChange": true}, "comment": {}}
            },
            "devices": {
                "d1": {
                    "name": "Press",
                    "options": {
                        "endpointUrl": {"currentValue": "opc.tcp://press:4840"},
                        "securityMode": {"currentValue": "SignAndEncrypt"},
                        "securityPolicy": {"currentValue": "Basic256Sha256"},
                        "anonymous": {"currentValue": false},
                        "userName": {"currentValue": "op"},
                        "password": {"currentValue": "secret"},
                        "timeout": {"currentValue": 3000}
                    },
                    "tags": {
                        "7": {
                            "name": "speed",
                            "type": "float",
                            "options": {
                                "nodeId": {"currentValue": "ns=3;s=Speed"},
                                "nodeType": {"currentValue": 10},
                                "arrayIndex": {"currentValue": -1}
                            }
                        },
                        "8": {"name": "broken", "type": "int", "options": {}}
                    }
                }
            }
        }))
        .unwrap();
        ConfigStore::from_document("unused.json", doc)
    }

    #[test]
    fn device_settings_snapshot() {
        let view = store().view();
        let settings = view.device_settings("d1").unwrap();
        assert_eq!(settings.endpoint_url.as_deref(), Some("opc.tcp://press:4840"));
        assert_eq!(settings.security_mode, SecurityModeName::SignAndEncrypt);
        assert_eq!(settings.security_policy, SecurityPolicyName::Basic256Sha256);
        assert!(!settings.anonymous);
        assert_eq!(settings.user_name.as_deref(), Some("op"));
        assert_eq!(settings.timeout_ms, 3000);
        assert_eq!(settings.browse_trigger, BrowseTrigger::Stop);
    }

    #[test]
    fn missing_device_yields_none() {
        let view = store().view();
        assert!(view.device_settings("nope").is_none());
        assert!(view.endpoint_url("nope").is_none());
        assert!(view.find_tag("nope", "speed").is_none());
    }

    #[test]
    fn tag_config_requires_node_options() {
        let view = store().view();
        let ok = view.find_tag("d1", "speed").unwrap();
        let cfg = TagConfig::from_tag(&ok).unwrap();
        assert_eq!(cfg.node_id, "ns=3;s=Speed");
        assert_eq!(cfg.node_type, 10);
        assert_eq!(cfg.array_index, -1);

        let broken = view.find_tag("d1", "broken").unwrap();
        assert!(TagConfig::from_tag(&broken).is_err());
    }

    #[test]
    fn restart_on_change_scheme_lookup() {
        let view = store().view();
        assert!(view.restart_on_change_device_option("endpointUrl"));
        assert!(!view.restart_on_change_device_option("browseTrigger"));
        assert!(view.restart_on_change_tag_option("nodeId"));
        assert!(!view.restart_on_change_tag_option("comment"));
    }

    #[test]
    fn legacy_policy_names_parse() {
        assert_eq!(
            "Aes128_Sha256_RsaOaep".parse::<SecurityPolicyName>().unwrap(),
            SecurityPolicyName::Aes128Sha256RsaOaep
        );
        assert_eq!(
            "Basic192Rsa15".parse::<SecurityPolicyName>().unwrap(),
            SecurityPolicyName::Basic192Rsa15
        );
        assert!("Basic512".parse::<SecurityPolicyName>().is_err());
    }
}
