//! Configuration model for the OPC UA supervisor bridge.
//!
//! The configuration document is a JSON file with `driver`, `optionsScheme`,
//! `nodes` and `devices` sections. The engine consumes it read-only through
//! [`ConfigView`]; the only mutations it performs are the browse-driven tag
//! population and the `browseTrigger` reset, both routed through
//! [`ConfigStore`].

mod config;
mod view;

pub use config::{
    ConfigDocument, ConfigStore, Device, DeviceOptions, DiscoveredTag, DriverSettings,
    OptionScheme, OptionValue, OptionsScheme, Tag, TagKind, TagOptions, TlsSettings,
};
pub use view::{BrowseTrigger, ConfigView, DeviceSettings, SecurityModeName, SecurityPolicyName, TagConfig};
