use super::*;

/// Framework initialization properties.
///
/// Anything placed in `properties` becomes a framework property; a
/// `framework.uid` entry forces the instance identifier, otherwise one is
/// generated at start-up.
#[derive(Clone, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(default))]
pub struct Config {
    pub properties: Properties,
}

impl std::fmt::Debug for Config {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Config")
            .field("properties", &self.properties)
            .finish()
    }
}
