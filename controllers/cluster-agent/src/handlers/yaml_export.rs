//! Mirrors selected kinds to YAML files.
//!
//! Layout: `<root>/<kindKey>/<namespace>_<name>.yaml`, or
//! `<root>/<kindKey>/<name>.yaml` for cluster-scoped objects. `managedFields`
//! is stripped before writing.

use super::KindHandler;
use crate::error::ControllerError;
use cluster_client::{ObjectRef, ResourceKindDescriptor};
use kube::core::DynamicObject;
use std::collections::HashSet;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Writes applied objects to disk and removes deleted ones
#[derive(Debug, Clone)]
pub struct YamlExporter {
    root: PathBuf,
}

impl YamlExporter {
    /// Exporter writing below `root`
    #[must_use]
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    fn kind_dir(&self, kind: &ResourceKindDescriptor) -> PathBuf {
        self.root.join(kind.kind_key())
    }

    fn file_name(key: &ObjectRef) -> String {
        if key.namespace.is_empty() {
            format!("{}.yaml", key.name)
        } else {
            format!("{}_{}.yaml", key.namespace, key.name)
        }
    }

    /// Path an object of `kind` is exported to
    #[must_use]
    pub fn path_for(&self, kind: &ResourceKindDescriptor, key: &ObjectRef) -> PathBuf {
        self.kind_dir(kind).join(Self::file_name(key))
    }
}

fn object_ref(obj: &DynamicObject) -> Result<ObjectRef, ControllerError> {
    ObjectRef::from_object(obj).ok_or_else(|| ControllerError::MalformedObject("object has no name".to_string()))
}

fn remove_if_present(path: &Path) -> Result<(), ControllerError> {
    match fs::remove_file(path) {
        Err(e) if e.kind() != ErrorKind::NotFound => Err(e.into()),
        _ => Ok(()),
    }
}

impl KindHandler for YamlExporter {
    fn name(&self) -> &'static str {
        "yaml-export"
    }

    fn on_apply(&self, kind: &ResourceKindDescriptor, obj: &DynamicObject) -> Result<(), ControllerError> {
        let key = object_ref(obj)?;
        let mut cleaned = obj.clone();
        cleaned.metadata.managed_fields = None;
        let yaml = serde_yaml::to_string(&cleaned)?;

        fs::create_dir_all(self.kind_dir(kind))?;
        let path = self.path_for(kind, &key);
        fs::write(&path, yaml)?;
        debug!("Exported {} {} to {}", kind.kind_key(), key, path.display());
        Ok(())
    }

    fn on_delete(&self, kind: &ResourceKindDescriptor, obj: &DynamicObject) -> Result<(), ControllerError> {
        let key = object_ref(obj)?;
        remove_if_present(&self.path_for(kind, &key))
    }

    fn on_resync(&self, kind: &ResourceKindDescriptor, live: &HashSet<ObjectRef>) -> Result<(), ControllerError> {
        let expected: HashSet<String> = live.iter().map(Self::file_name).collect();
        let entries = match fs::read_dir(self.kind_dir(kind)) {
            Ok(entries) => entries,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        for entry in entries {
            let entry = entry?;
            let file_name = entry.file_name().to_string_lossy().to_string();
            if file_name.ends_with(".yaml") && !expected.contains(&file_name) {
                remove_if_present(&entry.path())?;
            }
        }
        Ok(())
    }
}
