//! Network domain — backend boundary, name normalization, interface-name
//! assignment, and hosts/DNS file maintenance.
//!
//! The connect/disconnect lifecycle itself lives on the container handle
//! (`ctr::network`), which holds the locks; this module provides the pieces
//! it composes.

pub mod backend;
pub mod helper;
pub mod hosts;

use std::collections::HashMap;

use crate::entity::PerNetworkOptions;
use crate::errors::EngineError;

pub use backend::{FakeNetwork, NetworkBackend, NetworkInfo, SetupOptions};

/// Resolve a user-supplied network reference (full name or ID prefix) to
/// the canonical network name.
pub async fn normalize_name(
    backend: &dyn NetworkBackend,
    name_or_id: &str,
) -> Result<String, EngineError> {
    if let Ok(info) = backend.network_inspect(name_or_id).await {
        return Ok(info.name);
    }
    let mut found: Option<String> = None;
    for info in backend.network_info().await? {
        if info.id.starts_with(name_or_id) {
            if found.is_some() {
                return Err(EngineError::NetworkExists(format!(
                    "more than one result for network ID prefix {}",
                    name_or_id
                )));
            }
            found = Some(info.name);
        }
    }
    found.ok_or_else(|| EngineError::NoSuchNetwork(name_or_id.to_string()))
}

/// Pick the in-container interface name for a new network attachment.
///
/// Priority: caller-requested name, then the driver name when the engine is
/// configured to name by device, then the first free `ethN`.
pub fn assign_interface_name(
    existing: &HashMap<String, PerNetworkOptions>,
    requested: &str,
    name_by_driver: bool,
    driver: &str,
) -> String {
    if !requested.is_empty() {
        return requested.to_string();
    }
    let taken: Vec<&str> = existing
        .values()
        .map(|o| o.interface_name.as_str())
        .collect();
    if name_by_driver && !driver.is_empty() && !taken.contains(&driver) {
        return driver.to_string();
    }
    let mut n = 0u32;
    loop {
        let candidate = format!("eth{}", n);
        if !taken.contains(&candidate.as_str()) {
            return candidate;
        }
        n += 1;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn opts(iface: &str) -> PerNetworkOptions {
        PerNetworkOptions {
            interface_name: iface.to_string(),
            ..Default::default()
        }
    }

    #[test]
    fn test_interface_name_assignment() {
        let mut existing = HashMap::new();
        assert_eq!(assign_interface_name(&existing, "", false, ""), "eth0");

        existing.insert("a".to_string(), opts("eth0"));
        assert_eq!(assign_interface_name(&existing, "", false, ""), "eth1");

        // A requested name always wins.
        assert_eq!(assign_interface_name(&existing, "net1", false, ""), "net1");

        // Driver naming applies only when free.
        assert_eq!(
            assign_interface_name(&existing, "", true, "bridge"),
            "bridge"
        );
        existing.insert("b".to_string(), opts("bridge"));
        assert_eq!(assign_interface_name(&existing, "", true, "bridge"), "eth1");
    }

    #[tokio::test]
    async fn test_normalize_by_prefix() {
        let backend = FakeNetwork::new();
        backend.add_network("front", "aabbccdd11223344", "bridge");
        backend.add_network("back", "ffeeddcc55667788", "bridge");

        assert_eq!(normalize_name(&backend, "front").await.unwrap(), "front");
        assert_eq!(normalize_name(&backend, "ffee").await.unwrap(), "back");
        assert!(matches!(
            normalize_name(&backend, "zzz").await,
            Err(EngineError::NoSuchNetwork(_))
        ));
    }
}
