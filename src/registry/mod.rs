//! Type registry: versioned descriptors published by producers.
//!
//! Bundles are JSON documents mapping type ids to versioned field tables
//! plus an enum table. Ingest enforces the evolution rules (monotonic
//! versions, no incompatible tag reuse, resolvable references); accepted
//! bundles persist under `registry/` and replay on startup in ingest order.

use std::collections::BTreeMap;
use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::RwLock;

use serde::{Deserialize, Serialize};

use crate::error::{Result, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    Created,
    Unchanged,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RendererSpec {
    pub esm_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub component: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum ItemsSpec {
    Simple(String),
    Ref {
        #[serde(rename = "type")]
        kind: String,
        #[serde(rename = "ref")]
        type_ref: String,
    },
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct FieldSpec {
    pub name: String,
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default)]
    pub optional: bool,
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub enum_ref: Option<String>,
    #[serde(rename = "ref", default, skip_serializing_if = "Option::is_none")]
    pub type_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub items: Option<ItemsSpec>,
}

impl FieldSpec {
    /// Tag reuse is legal only when the declared shape is unchanged.
    fn compatible_with(&self, other: &FieldSpec) -> bool {
        self.field_type == other.field_type
            && self.optional == other.optional
            && self.enum_ref == other.enum_ref
            && self.type_ref == other.type_ref
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TypeVersionSpec {
    pub version: u32,
    pub fields: BTreeMap<u32, FieldSpec>,
    pub renderer: Option<RendererSpec>,
}

// Wire shape of a bundle document.
#[derive(Debug, Deserialize)]
struct BundleDoc {
    #[serde(default)]
    #[allow(dead_code)]
    registry_version: u32,
    bundle_id: String,
    #[serde(default)]
    types: BTreeMap<String, TypeDoc>,
    #[serde(default)]
    enums: BTreeMap<String, BTreeMap<String, String>>,
}

#[derive(Debug, Deserialize)]
struct TypeDoc {
    versions: BTreeMap<String, VersionDoc>,
}

#[derive(Debug, Deserialize)]
struct VersionDoc {
    #[serde(default)]
    fields: BTreeMap<String, FieldSpec>,
    #[serde(default)]
    renderer: Option<RendererSpec>,
}

struct RegistryInner {
    dir: PathBuf,
    bundles: BTreeMap<String, Vec<u8>>,
    types: BTreeMap<String, BTreeMap<u32, TypeVersionSpec>>,
    enums: BTreeMap<String, BTreeMap<u64, String>>,
    last_bundle_id: Option<String>,
}

pub struct Registry {
    inner: RwLock<RegistryInner>,
}

impl Registry {
    pub fn open(dir: &Path) -> Result<Self> {
        fs::create_dir_all(dir)?;
        let mut inner = RegistryInner {
            dir: dir.to_path_buf(),
            bundles: BTreeMap::new(),
            types: BTreeMap::new(),
            enums: BTreeMap::new(),
            last_bundle_id: None,
        };

        let manifest = dir.join("manifest.log");
        if manifest.exists() {
            for stem in fs::read_to_string(&manifest)?.lines() {
                let path = dir.join(format!("{stem}.json"));
                let bytes = match fs::read(&path) {
                    Ok(bytes) => bytes,
                    Err(err) => {
                        tracing::warn!(bundle = stem, "skipping unreadable bundle: {err}");
                        continue;
                    }
                };
                if let Err(err) = ingest(&mut inner, &bytes) {
                    tracing::warn!(bundle = stem, "skipping invalid bundle on replay: {err}");
                }
            }
        }

        Ok(Self {
            inner: RwLock::new(inner),
        })
    }

    pub fn put_bundle(&self, bundle_id: &str, bytes: &[u8]) -> Result<PutOutcome> {
        let mut inner = self.inner.write().expect("registry poisoned");

        if let Some(existing) = inner.bundles.get(bundle_id)
            && existing.as_slice() == bytes
        {
            return Ok(PutOutcome::Unchanged);
        }

        let doc_id = ingest_precheck(bytes)?;
        if doc_id != bundle_id {
            return Err(StoreError::InvalidInput(format!(
                "bundle_id mismatch: path says {bundle_id:?}, body says {doc_id:?}"
            )));
        }

        ingest(&mut inner, bytes)?;

        // Persist only after validation: the manifest orders replay.
        let stem = bundle_stem(bundle_id);
        let path = inner.dir.join(format!("{stem}.json"));
        fs::write(&path, bytes)?;
        let mut manifest = fs::OpenOptions::new()
            .append(true)
            .create(true)
            .open(inner.dir.join("manifest.log"))?;
        writeln!(manifest, "{stem}")?;
        manifest.sync_data()?;

        Ok(PutOutcome::Created)
    }

    pub fn get_bundle(&self, bundle_id: &str) -> Option<Vec<u8>> {
        self.inner
            .read()
            .expect("registry poisoned")
            .bundles
            .get(bundle_id)
            .cloned()
    }

    pub fn get_type_version(&self, type_id: &str, version: u32) -> Option<TypeVersionSpec> {
        self.inner
            .read()
            .expect("registry poisoned")
            .types
            .get(type_id)
            .and_then(|versions| versions.get(&version))
            .cloned()
    }

    pub fn latest_version(&self, type_id: &str) -> Option<u32> {
        self.inner
            .read()
            .expect("registry poisoned")
            .types
            .get(type_id)
            .and_then(|versions| versions.keys().next_back().copied())
    }

    pub fn get_latest(&self, type_id: &str) -> Option<TypeVersionSpec> {
        self.inner
            .read()
            .expect("registry poisoned")
            .types
            .get(type_id)
            .and_then(|versions| versions.values().next_back())
            .cloned()
    }

    pub fn enum_label(&self, enum_id: &str, ordinal: u64) -> Option<String> {
        self.inner
            .read()
            .expect("registry poisoned")
            .enums
            .get(enum_id)
            .and_then(|table| table.get(&ordinal))
            .cloned()
    }

    /// Latest-version renderer per type, for types that declare one.
    pub fn get_all_renderers(&self) -> BTreeMap<String, RendererSpec> {
        let inner = self.inner.read().expect("registry poisoned");
        inner
            .types
            .iter()
            .filter_map(|(type_id, versions)| {
                versions
                    .values()
                    .next_back()
                    .and_then(|spec| spec.renderer.clone())
                    .map(|renderer| (type_id.clone(), renderer))
            })
            .collect()
    }

    pub fn last_bundle_id(&self) -> Option<String> {
        self.inner
            .read()
            .expect("registry poisoned")
            .last_bundle_id
            .clone()
    }

    pub fn type_count(&self) -> usize {
        self.inner.read().expect("registry poisoned").types.len()
    }
}

fn bundle_stem(bundle_id: &str) -> String {
    // Bundle ids carry timestamps and '#'; the filename is a digest stem.
    hex::encode(&blake3::hash(bundle_id.as_bytes()).as_bytes()[..8])
}

fn ingest_precheck(bytes: &[u8]) -> Result<String> {
    let doc: BundleDoc = serde_json::from_slice(bytes)
        .map_err(|e| StoreError::InvalidInput(format!("invalid bundle json: {e}")))?;
    Ok(doc.bundle_id)
}

/// Validate `bytes` against the accepted state in `inner` and merge on
/// success. All rule violations surface as Conflict naming the offender.
fn ingest(inner: &mut RegistryInner, bytes: &[u8]) -> Result<()> {
    let doc: BundleDoc = serde_json::from_slice(bytes)
        .map_err(|e| StoreError::InvalidInput(format!("invalid bundle json: {e}")))?;

    // Build candidate enum table: stored plus this bundle.
    let mut enums = inner.enums.clone();
    for (enum_id, table) in &doc.enums {
        let parsed: BTreeMap<u64, String> = table
            .iter()
            .map(|(ordinal, label)| {
                ordinal
                    .parse::<u64>()
                    .map(|n| (n, label.clone()))
                    .map_err(|_| {
                        StoreError::InvalidInput(format!(
                            "enum {enum_id} ordinal {ordinal:?} is not numeric"
                        ))
                    })
            })
            .collect::<Result<_>>()?;
        enums.entry(enum_id.clone()).or_default().extend(parsed);
    }

    // Build candidate type table, enforcing evolution rules.
    let mut types = inner.types.clone();
    for (type_id, type_doc) in &doc.types {
        let mut versions: Vec<(u32, &VersionDoc)> = type_doc
            .versions
            .iter()
            .map(|(version, doc)| {
                version
                    .parse::<u32>()
                    .map(|n| (n, doc))
                    .map_err(|_| {
                        StoreError::InvalidInput(format!(
                            "type {type_id} version {version:?} is not numeric"
                        ))
                    })
            })
            .collect::<Result<_>>()?;
        versions.sort_by_key(|(version, _)| *version);

        for (version, version_doc) in versions {
            let fields: BTreeMap<u32, FieldSpec> = version_doc
                .fields
                .iter()
                .map(|(tag, spec)| {
                    tag.parse::<u32>().map(|n| (n, spec.clone())).map_err(|_| {
                        StoreError::InvalidInput(format!(
                            "type {type_id}@{version} field tag {tag:?} is not numeric"
                        ))
                    })
                })
                .collect::<Result<_>>()?;

            let spec = TypeVersionSpec {
                version,
                fields,
                renderer: version_doc.renderer.clone(),
            };

            let stored = types.entry(type_id.clone()).or_default();
            if let Some(existing) = stored.get(&version) {
                if existing.fields == spec.fields {
                    continue; // idempotent redeclaration
                }
                return Err(StoreError::Conflict(format!(
                    "type {type_id}@{version} redeclared with different fields"
                )));
            }
            if let Some(max) = stored.keys().next_back().copied()
                && version < max
            {
                return Err(StoreError::Conflict(format!(
                    "type {type_id} version {version} regresses below stored max {max}"
                )));
            }

            // Tag reuse across versions must keep the declared shape.
            for (tag, field) in &spec.fields {
                for earlier in stored.values() {
                    if let Some(prior) = earlier.fields.get(tag)
                        && !prior.compatible_with(field)
                    {
                        return Err(StoreError::Conflict(format!(
                            "type {type_id}@{version} field tag {tag} ({}) reuses a tag \
                             declared as {} in version {}",
                            field.name, prior.name, earlier.version
                        )));
                    }
                }
            }

            stored.insert(version, spec);
        }
    }

    // Every reference must resolve against the merged candidate state.
    for (type_id, versions) in &types {
        for spec in versions.values() {
            for (tag, field) in &spec.fields {
                if let Some(enum_id) = &field.enum_ref
                    && !enums.contains_key(enum_id)
                {
                    return Err(StoreError::Conflict(format!(
                        "type {type_id}@{} field tag {tag} references unknown enum {enum_id}",
                        spec.version
                    )));
                }
                if let Some(ref_id) = &field.type_ref
                    && !types.contains_key(ref_id)
                {
                    return Err(StoreError::Conflict(format!(
                        "type {type_id}@{} field tag {tag} references unknown type {ref_id}",
                        spec.version
                    )));
                }
                if let Some(ItemsSpec::Ref { type_ref, .. }) = &field.items
                    && !types.contains_key(type_ref)
                {
                    return Err(StoreError::Conflict(format!(
                        "type {type_id}@{} field tag {tag} array items reference unknown \
                         type {type_ref}",
                        spec.version
                    )));
                }
            }
        }
    }

    inner.types = types;
    inner.enums = enums;
    inner.bundles.insert(doc.bundle_id.clone(), bytes.to_vec());
    inner.last_bundle_id = Some(doc.bundle_id);
    Ok(())
}
