use crate::engine::EngineError;
use crate::model::DeviceId;

/// The devices a shift can be scheduled on, in declaration order.
const DEFAULT_DEVICES: [(&str, &str); 5] = [
    ("WHITE_PC", "白PC"),
    ("BLACK_PC", "黒PC"),
    ("LAPTOP", "ノートPC"),
    ("MAC1", "Mac1"),
    ("MAC2", "Mac2"),
];

/// Fixed lookup table of schedulable devices and their display labels.
#[derive(Debug, Clone)]
pub struct DeviceRegistry {
    entries: Vec<(DeviceId, String)>,
}

impl Default for DeviceRegistry {
    fn default() -> Self {
        Self::new(DEFAULT_DEVICES.iter().map(|(id, label)| (*id, *label)))
    }
}

impl DeviceRegistry {
    /// Build a registry from `(id, label)` pairs. Later duplicates are ignored.
    pub fn new<I, S, L>(entries: I) -> Self
    where
        I: IntoIterator<Item = (S, L)>,
        S: Into<String>,
        L: Into<String>,
    {
        let mut out: Vec<(DeviceId, String)> = Vec::new();
        for (id, label) in entries {
            let id = DeviceId::new(id);
            if out.iter().any(|(existing, _)| *existing == id) {
                continue;
            }
            out.push((id, label.into()));
        }
        Self { entries: out }
    }

    pub fn list_devices(&self) -> Vec<DeviceId> {
        self.entries.iter().map(|(id, _)| id.clone()).collect()
    }

    pub fn contains(&self, device: &DeviceId) -> bool {
        self.entries.iter().any(|(id, _)| id == device)
    }

    pub fn label(&self, device: &DeviceId) -> Result<&str, EngineError> {
        self.entries
            .iter()
            .find(|(id, _)| id == device)
            .map(|(_, label)| label.as_str())
            .ok_or_else(|| EngineError::UnknownDevice(device.to_string()))
    }

    /// Map caller-supplied text onto a registered device. Exact match only.
    pub fn resolve(&self, raw: &str) -> Result<DeviceId, EngineError> {
        self.entries
            .iter()
            .find(|(id, _)| id.as_str() == raw)
            .map(|(id, _)| id.clone())
            .ok_or_else(|| EngineError::InvalidDevice(raw.to_string()))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_registry_keeps_declaration_order() {
        let reg = DeviceRegistry::default();
        let ids: Vec<String> = reg.list_devices().iter().map(|d| d.to_string()).collect();
        assert_eq!(ids, vec!["WHITE_PC", "BLACK_PC", "LAPTOP", "MAC1", "MAC2"]);
    }

    #[test]
    fn label_lookup() {
        let reg = DeviceRegistry::default();
        assert_eq!(reg.label(&DeviceId::new("WHITE_PC")).unwrap(), "白PC");
        assert_eq!(reg.label(&DeviceId::new("MAC2")).unwrap(), "Mac2");
    }

    #[test]
    fn unknown_device_label_fails() {
        let reg = DeviceRegistry::default();
        let err = reg.label(&DeviceId::new("PRINTER")).unwrap_err();
        assert!(matches!(err, EngineError::UnknownDevice(ref d) if d == "PRINTER"));
    }

    #[test]
    fn resolve_is_exact() {
        let reg = DeviceRegistry::default();
        assert_eq!(reg.resolve("LAPTOP").unwrap(), DeviceId::new("LAPTOP"));
        assert!(matches!(reg.resolve("laptop"), Err(EngineError::InvalidDevice(_))));
        assert!(matches!(reg.resolve(""), Err(EngineError::InvalidDevice(_))));
    }

    #[test]
    fn custom_registry_drops_duplicates() {
        let reg = DeviceRegistry::new([("A", "first"), ("B", "b"), ("A", "second")]);
        assert_eq!(reg.len(), 2);
        assert_eq!(reg.label(&DeviceId::new("A")).unwrap(), "first");
    }
}
