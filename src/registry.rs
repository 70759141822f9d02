//! Device registry
//!
//! Holds the result of the last discovery scan. A scan builds a complete
//! new snapshot and swaps it in, so readers see either the old or the new
//! list, never a mix.

use std::net::IpAddr;
use std::sync::{Arc, RwLock};
use std::time::Duration;
use tracing::{info, warn};

use crate::error::{StreamError, StreamResult};
use crate::models::{CapabilityClass, Device, RawDeviceInfo};
use crate::stream::cast::CastClient;

/// Map a vendor type string onto a capability class.
///
/// Anything unrecognised is a `Display`: the segmented pipeline plays on
/// strictly more devices than the real-time one.
pub fn classify(raw: &RawDeviceInfo) -> CapabilityClass {
    match raw
        .cast_type
        .as_deref()
        .map(|t| t.trim().to_ascii_lowercase())
        .as_deref()
    {
        Some("audio") => CapabilityClass::Speaker,
        Some("group") => CapabilityClass::Group,
        _ => CapabilityClass::Display,
    }
}

fn to_device(raw: &RawDeviceInfo, members: Vec<Device>) -> Option<Device> {
    let address: IpAddr = match raw.ip.parse() {
        Ok(ip) => ip,
        Err(_) => {
            warn!("Skipping '{}': bad address '{}'", raw.name, raw.ip);
            return None;
        }
    };
    let class = classify(raw);
    Some(Device {
        // Groups share their leader's address, so the port disambiguates
        id: if class == CapabilityClass::Group {
            format!("{}:{}", raw.ip, raw.port)
        } else {
            raw.ip.clone()
        },
        display_name: raw.name.clone(),
        class,
        address,
        port: raw.port,
        model: raw.model.clone(),
        group_members: members,
    })
}

/// Discovered devices, read-mostly
pub struct DeviceRegistry {
    client: Arc<dyn CastClient>,
    snapshot: RwLock<Arc<Vec<Device>>>,
}

impl DeviceRegistry {
    pub fn new(client: Arc<dyn CastClient>) -> Self {
        Self {
            client,
            snapshot: RwLock::new(Arc::new(Vec::new())),
        }
    }

    /// Discover devices and replace the snapshot.
    ///
    /// A failed membership query keeps the group with no members rather
    /// than dropping the whole scan.
    pub async fn scan(&self, timeout: Duration) -> StreamResult<Arc<Vec<Device>>> {
        let raw = self.client.discover(timeout).await?;

        let mut devices = Vec::with_capacity(raw.len());
        for info in &raw {
            let members = if classify(info) == CapabilityClass::Group {
                match self.client.group_members(info).await {
                    Ok(members) => members
                        .iter()
                        .filter_map(|m| to_device(m, Vec::new()))
                        .collect(),
                    Err(e) => {
                        warn!("Could not read members of group '{}': {}", info.name, e);
                        Vec::new()
                    }
                }
            } else {
                Vec::new()
            };
            if let Some(device) = to_device(info, members) {
                devices.push(device);
            }
        }

        let count = |class| devices.iter().filter(|d| d.class == class).count();
        info!(
            "Found {} speakers, {} displays, {} groups",
            count(CapabilityClass::Speaker),
            count(CapabilityClass::Display),
            count(CapabilityClass::Group)
        );

        let snapshot = Arc::new(devices);
        match self.snapshot.write() {
            Ok(mut guard) => *guard = snapshot.clone(),
            Err(poisoned) => *poisoned.into_inner() = snapshot.clone(),
        }
        Ok(snapshot)
    }

    /// Current snapshot
    pub fn devices(&self) -> Arc<Vec<Device>> {
        match self.snapshot.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    /// Look a device up by id or name, including group members
    pub fn resolve(&self, key: &str) -> Option<Device> {
        let devices = self.devices();
        devices
            .iter()
            .find(|d| d.matches(key))
            .or_else(|| {
                devices
                    .iter()
                    .flat_map(|d| d.group_members.iter())
                    .find(|m| m.matches(key))
            })
            .cloned()
    }

    /// Like [`resolve`](Self::resolve) but failing with `DeviceNotFound`
    pub fn require(&self, key: &str) -> StreamResult<Device> {
        self.resolve(key)
            .ok_or_else(|| StreamError::DeviceNotFound(key.to_string()))
    }

    /// Replace the snapshot directly
    pub fn replace(&self, devices: Vec<Device>) {
        let snapshot = Arc::new(devices);
        match self.snapshot.write() {
            Ok(mut guard) => *guard = snapshot,
            Err(poisoned) => *poisoned.into_inner() = snapshot,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn raw(name: &str, ip: &str, cast_type: Option<&str>) -> RawDeviceInfo {
        RawDeviceInfo {
            name: name.into(),
            model: None,
            ip: ip.into(),
            port: 8009,
            cast_type: cast_type.map(String::from),
        }
    }

    #[test]
    fn test_classify() {
        assert_eq!(classify(&raw("a", "1.1.1.1", Some("audio"))), CapabilityClass::Speaker);
        assert_eq!(classify(&raw("a", "1.1.1.1", Some("AUDIO "))), CapabilityClass::Speaker);
        assert_eq!(classify(&raw("a", "1.1.1.1", Some("group"))), CapabilityClass::Group);
        assert_eq!(classify(&raw("a", "1.1.1.1", Some("cast"))), CapabilityClass::Display);
        assert_eq!(classify(&raw("a", "1.1.1.1", Some("soundbar-x"))), CapabilityClass::Display);
        assert_eq!(classify(&raw("a", "1.1.1.1", None)), CapabilityClass::Display);
    }

    #[test]
    fn test_group_id_includes_port() {
        let mut info = raw("Downstairs", "192.168.1.20", Some("group"));
        info.port = 32187;
        let device = to_device(&info, vec![]).unwrap();
        assert_eq!(device.id, "192.168.1.20:32187");
        assert!(to_device(&raw("x", "not-an-ip", None), vec![]).is_none());
    }
}
