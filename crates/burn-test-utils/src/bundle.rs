//! Bundle manifests for tests.
//!
//! [`TestBundleBuilder`] assembles a manifest from [`TestPackage`]s. Every
//! package gets one loose payload, `<id>.bin`, with known bytes and a
//! SHA-256 verification, so the same bundle works against the in-memory
//! cache and, after [`TestBundleBuilder::write_to`], the file cache.

use std::path::{Path, PathBuf};

use burn_core::BundleModel;
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};

/// Bytes of a package's generated payload.
pub fn payload_bytes(package_id: &str) -> Vec<u8> {
    format!("payload for {package_id}").into_bytes()
}

pub fn payload_key(package_id: &str) -> String {
    format!("{package_id}.bin")
}

/// One chain package.
#[derive(Debug, Clone)]
pub struct TestPackage {
    id: String,
    fields: Map<String, Value>,
    external: bool,
}

impl TestPackage {
    fn new(id: &str, kind: Value) -> Self {
        let Value::Object(mut fields) = kind else {
            unreachable!("package kinds are objects");
        };
        fields.insert("id".into(), json!(id));
        fields.insert("payloads".into(), json!([payload_key(id)]));
        Self {
            id: id.to_string(),
            fields,
            external: false,
        }
    }

    /// An EXE package with quiet install and uninstall arguments. Detected
    /// as present when the variable `<id>Installed` is set.
    pub fn exe(id: &str) -> Self {
        Self::new(
            id,
            json!({
                "type": "exe",
                "install_arguments": "/quiet",
                "uninstall_arguments": "/uninstall /quiet",
                "repair_arguments": "/repair /quiet",
                "detect_condition": format!("{id}Installed"),
            }),
        )
    }

    pub fn msi(id: &str, product_code: &str, version: &str) -> Self {
        Self::new(
            id,
            json!({ "type": "msi", "product_code": product_code, "version": version }),
        )
    }

    pub fn msu(id: &str, kb: &str) -> Self {
        Self::new(
            id,
            json!({ "type": "msu", "kb": kb, "detect_condition": format!("{id}Installed") }),
        )
    }

    fn set(mut self, key: &str, value: Value) -> Self {
        self.fields.insert(key.to_string(), value);
        self
    }

    pub fn vital(self, vital: bool) -> Self {
        self.set("vital", json!(vital))
    }

    pub fn permanent(self) -> Self {
        self.set("permanent", json!(true))
    }

    pub fn per_machine(self) -> Self {
        self.set("per_machine", json!(true))
    }

    /// `"keep"`, `"remove"` or `"force"`.
    pub fn cache(self, cache: &str) -> Self {
        self.set("cache", json!(cache))
    }

    pub fn install_condition(self, condition: &str) -> Self {
        self.set("install_condition", json!(condition))
    }

    pub fn detect_condition(self, condition: &str) -> Self {
        self.set("detect_condition", json!(condition))
    }

    /// Start rollback boundary `id` before this package.
    pub fn boundary(self, id: &str) -> Self {
        self.set("rollback_boundary", json!(id))
    }

    pub fn provider(self, key: &str) -> Self {
        self.set("providers", json!([{ "key": key }]))
    }

    /// Ship the payload next to the bundle instead of inside it.
    pub fn external(mut self) -> Self {
        self.external = true;
        self
    }

    fn payload(&self) -> Value {
        let bytes = payload_bytes(&self.id);
        let mut payload = json!({
            "key": payload_key(&self.id),
            "file_path": payload_key(&self.id),
            "size": bytes.len(),
            "verification": { "method": "hash", "sha256": hex::encode(Sha256::digest(&bytes)) },
        });
        if self.external {
            payload["packaging"] = json!("external");
        }
        payload
    }
}

/// Fluent builder for [`BundleModel`] in tests.
///
/// # Example
///
/// ```ignore
/// let model = TestBundleBuilder::new("{B0B0}")
///     .boundary("rb1", true)
///     .package(TestPackage::exe("Redist"))
///     .package(TestPackage::msi("App", "{AAAA}", "1.0.0").boundary("rb1"))
///     .build();
/// ```
#[derive(Debug, Clone)]
pub struct TestBundleBuilder {
    bundle: Map<String, Value>,
    packages: Vec<TestPackage>,
    boundaries: Vec<Value>,
    approved_exes: Vec<Value>,
    variables: Vec<Value>,
}

impl TestBundleBuilder {
    pub fn new(bundle_id: &str) -> Self {
        let Value::Object(bundle) = json!({
            "id": bundle_id,
            "name": "Test Bundle",
            "version": "1.0.0",
            "provider_key": "test.bundle",
        }) else {
            unreachable!("bundle identity is an object");
        };
        Self {
            bundle,
            packages: Vec::new(),
            boundaries: Vec::new(),
            approved_exes: Vec::new(),
            variables: Vec::new(),
        }
    }

    pub fn version(mut self, version: &str) -> Self {
        self.bundle.insert("version".into(), json!(version));
        self
    }

    pub fn provider_key(mut self, key: &str) -> Self {
        self.bundle.insert("provider_key".into(), json!(key));
        self
    }

    pub fn per_machine(mut self) -> Self {
        self.bundle.insert("per_machine".into(), json!(true));
        self
    }

    pub fn upgrade_code(mut self, code: &str) -> Self {
        self.bundle
            .insert("related".into(), json!({ "upgrade": [code] }));
        self
    }

    pub fn boundary(mut self, id: &str, vital: bool) -> Self {
        self.boundaries.push(json!({ "id": id, "vital": vital }));
        self
    }

    /// A boundary whose MSI packages run inside one transaction.
    pub fn transaction_boundary(mut self, id: &str) -> Self {
        self.boundaries
            .push(json!({ "id": id, "vital": true, "transaction": true }));
        self
    }

    pub fn package(mut self, package: TestPackage) -> Self {
        self.packages.push(package);
        self
    }

    pub fn approved_exe(mut self, id: &str, path: &str) -> Self {
        self.approved_exes.push(json!({ "id": id, "path": path }));
        self
    }

    pub fn variable(mut self, name: &str, value: &str) -> Self {
        self.variables.push(json!({ "name": name, "value": value }));
        self
    }

    pub fn hidden_variable(mut self, name: &str, value: &str) -> Self {
        self.variables
            .push(json!({ "name": name, "value": value, "hidden": true }));
        self
    }

    /// The manifest as JSON.
    pub fn to_json(&self) -> String {
        let manifest = json!({
            "bundle": self.bundle,
            "payloads": self.packages.iter().map(TestPackage::payload).collect::<Vec<_>>(),
            "packages": self.packages.iter().map(|p| Value::Object(p.fields.clone())).collect::<Vec<_>>(),
            "rollback_boundaries": self.boundaries,
            "approved_exes": self.approved_exes,
            "variables": self.variables,
        });
        manifest.to_string()
    }

    /// Parse and validate the manifest. Panics when it does not validate.
    pub fn build(&self) -> BundleModel {
        BundleModel::from_json(&self.to_json()).expect("test bundle does not validate")
    }

    /// Write `bundle.json` and every payload into `dir`, returning the
    /// manifest path.
    pub fn write_to(&self, dir: &Path) -> PathBuf {
        std::fs::create_dir_all(dir).expect("failed to create bundle directory");
        for package in &self.packages {
            std::fs::write(dir.join(payload_key(&package.id)), payload_bytes(&package.id))
                .expect("failed to write payload");
        }
        let manifest = dir.join("bundle.json");
        std::fs::write(&manifest, self.to_json()).expect("failed to write manifest");
        manifest
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builds_a_valid_model() {
        let model = TestBundleBuilder::new("{B0B0}")
            .boundary("rb1", true)
            .package(TestPackage::exe("Redist").external())
            .package(TestPackage::msi("App", "{AAAA}", "1.0.0").boundary("rb1"))
            .build();
        assert_eq!(model.packages.len(), 2);
        assert_eq!(model.payloads.len(), 2);
        assert_eq!(model.packages[1].rollback_boundary.as_deref(), Some("rb1"));
    }

    #[test]
    fn test_write_to_places_payloads_beside_manifest() {
        let dir = tempfile::tempdir().unwrap();
        let manifest = TestBundleBuilder::new("{B0B0}")
            .package(TestPackage::exe("Redist"))
            .write_to(dir.path());
        assert!(manifest.exists());
        assert_eq!(
            std::fs::read(dir.path().join("Redist.bin")).unwrap(),
            payload_bytes("Redist")
        );
    }
}
