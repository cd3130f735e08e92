use reqwest::Url;
use serde::{Deserialize, Serialize};

use crate::error::{FleetError, Result};

/// A named worker host that can perform downloads
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Endpoint {
    pub name: String,
    pub address: String,
}

impl Endpoint {
    /// Build an endpoint, checking the name is non-blank and the address is
    /// an absolute http(s) URL. A trailing slash on the address is dropped.
    pub fn new(name: &str, address: &str) -> Result<Self> {
        let name = name.trim();
        if name.is_empty() {
            return Err(FleetError::InvalidEndpoint {
                name: name.to_string(),
                reason: "name must not be empty".to_string(),
            });
        }

        let address = address.trim().trim_end_matches('/');
        let url = Url::parse(address).map_err(|e| FleetError::InvalidEndpoint {
            name: name.to_string(),
            reason: format!("address '{}' is not a valid URL: {}", address, e),
        })?;

        if !matches!(url.scheme(), "http" | "https") {
            return Err(FleetError::InvalidEndpoint {
                name: name.to_string(),
                reason: format!("unsupported scheme '{}'", url.scheme()),
            });
        }

        Ok(Endpoint {
            name: name.to_string(),
            address: address.to_string(),
        })
    }

    /// Join a surface path (e.g. `/civitai/status`) onto the base address
    pub fn url_for(&self, path: &str) -> String {
        if path.starts_with('/') {
            format!("{}{}", self.address, path)
        } else {
            format!("{}/{}", self.address, path)
        }
    }
}

/// Ordered set of known endpoints, unique by name.
///
/// Registering a name that is already present is rejected with
/// `FleetError::DuplicateEndpoint` and leaves the registry untouched.
#[derive(Debug, Clone, Default)]
pub struct Registry {
    endpoints: Vec<Endpoint>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_endpoints<I>(endpoints: I) -> Result<Self>
    where
        I: IntoIterator<Item = Endpoint>,
    {
        let mut registry = Registry::new();
        for endpoint in endpoints {
            registry.add(endpoint)?;
        }
        Ok(registry)
    }

    pub fn add(&mut self, endpoint: Endpoint) -> Result<()> {
        if self.contains(&endpoint.name) {
            return Err(FleetError::DuplicateEndpoint(endpoint.name));
        }
        self.endpoints.push(endpoint);
        Ok(())
    }

    pub fn remove(&mut self, name: &str) -> Result<Endpoint> {
        let index = self
            .endpoints
            .iter()
            .position(|e| e.name == name)
            .ok_or_else(|| FleetError::UnknownEndpoint(name.to_string()))?;
        Ok(self.endpoints.remove(index))
    }

    pub fn all(&self) -> &[Endpoint] {
        &self.endpoints
    }

    pub fn by_name(&self, name: &str) -> Result<&Endpoint> {
        self.endpoints
            .iter()
            .find(|e| e.name == name)
            .ok_or_else(|| FleetError::UnknownEndpoint(name.to_string()))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.endpoints.iter().any(|e| e.name == name)
    }

    pub fn len(&self) -> usize {
        self.endpoints.len()
    }

    pub fn is_empty(&self) -> bool {
        self.endpoints.is_empty()
    }

    /// Owned copy of the current sequence, taken before every fan-out
    pub fn snapshot(&self) -> Vec<Endpoint> {
        self.endpoints.clone()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn endpoint(name: &str, port: u16) -> Endpoint {
        Endpoint::new(name, &format!("http://127.0.0.1:{}", port)).unwrap()
    }

    #[test]
    fn test_insertion_order_is_preserved() {
        let mut registry = Registry::new();
        registry.add(endpoint("PC2", 7861)).unwrap();
        registry.add(endpoint("PC1", 7860)).unwrap();
        registry.add(endpoint("VPS", 7862)).unwrap();

        let names: Vec<&str> = registry.all().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["PC2", "PC1", "VPS"]);
    }

    #[test]
    fn test_duplicate_name_is_rejected_every_time() {
        let mut registry = Registry::new();
        registry.add(endpoint("PC1", 7860)).unwrap();

        for port in [7861, 7862] {
            let err = registry.add(endpoint("PC1", port)).unwrap_err();
            assert!(matches!(err, FleetError::DuplicateEndpoint(ref n) if n == "PC1"));
        }

        assert_eq!(registry.len(), 1);
        assert_eq!(registry.by_name("PC1").unwrap().address, "http://127.0.0.1:7860");
    }

    #[test]
    fn test_by_name_unknown() {
        let registry = Registry::from_endpoints(vec![endpoint("PC1", 7860)]).unwrap();
        assert!(matches!(
            registry.by_name("PC9"),
            Err(FleetError::UnknownEndpoint(_))
        ));
    }

    #[test]
    fn test_remove_then_re_add() {
        let mut registry = Registry::from_endpoints(vec![endpoint("A", 1), endpoint("B", 2)]).unwrap();
        let removed = registry.remove("A").unwrap();
        assert_eq!(removed.name, "A");
        assert!(registry.remove("A").is_err());

        registry.add(endpoint("A", 3)).unwrap();
        let names: Vec<&str> = registry.all().iter().map(|e| e.name.as_str()).collect();
        assert_eq!(names, vec!["B", "A"]);
    }

    #[test]
    fn test_endpoint_validation() {
        assert!(Endpoint::new("  ", "http://localhost:7860").is_err());
        assert!(Endpoint::new("PC1", "not a url").is_err());
        assert!(Endpoint::new("PC1", "ftp://host/").is_err());

        let e = Endpoint::new(" PC1 ", "http://192.168.1.100:7860/").unwrap();
        assert_eq!(e.name, "PC1");
        assert_eq!(e.address, "http://192.168.1.100:7860");
        assert_eq!(e.url_for("/civitai/status"), "http://192.168.1.100:7860/civitai/status");
        assert_eq!(e.url_for("civitai/status"), "http://192.168.1.100:7860/civitai/status");
    }
}
