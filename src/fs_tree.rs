//! Filesystem snapshot trees.
//!
//! Clients capture a workspace as a Merkle tree: file contents and
//! serialized directory objects are CAS blobs, directories reference their
//! children by hash. The server only decodes and walks these trees to serve
//! the HTTP view; it never builds them.
//!
//! A tree object is a msgpack array of entries. Each entry is a map with
//! numeric tags (integer keys or digit-string keys): 1 name, 2 kind,
//! 3 mode, 4 size, 5 hash.

use rmpv::Value;

use crate::error::{Result, StoreError};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryKind {
    File,
    Directory,
    Symlink,
}

impl EntryKind {
    pub fn from_u8(raw: u8) -> Result<Self> {
        match raw {
            0 => Ok(EntryKind::File),
            1 => Ok(EntryKind::Directory),
            2 => Ok(EntryKind::Symlink),
            other => Err(StoreError::Decode(format!("unknown tree entry kind {other}"))),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::File => "file",
            EntryKind::Directory => "dir",
            EntryKind::Symlink => "symlink",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TreeEntry {
    pub name: String,
    pub kind: EntryKind,
    pub mode: u32,
    pub size: u64,
    pub hash: [u8; 32],
}

/// Result of resolving a path inside a snapshot.
#[derive(Debug)]
pub enum Located {
    Directory(Vec<TreeEntry>),
    File { entry: TreeEntry, content: Vec<u8> },
}

pub fn decode_tree(bytes: &[u8]) -> Result<Vec<TreeEntry>> {
    let value = rmpv::decode::read_value(&mut &bytes[..])
        .map_err(|e| StoreError::Decode(format!("tree object msgpack: {e}")))?;
    let Value::Array(items) = value else {
        return Err(StoreError::Decode("tree object is not an array".into()));
    };
    items.iter().map(decode_entry).collect()
}

fn decode_entry(value: &Value) -> Result<TreeEntry> {
    let Value::Map(pairs) = value else {
        return Err(StoreError::Decode("tree entry is not a map".into()));
    };

    let mut name = None;
    let mut kind = None;
    let mut mode = 0u32;
    let mut size = 0u64;
    let mut hash = None;

    for (key, val) in pairs {
        let Some(tag) = numeric_tag(key) else {
            return Err(StoreError::Decode("tree entry key is not numeric".into()));
        };
        match tag {
            1 => {
                name = Some(
                    val.as_str()
                        .ok_or_else(|| StoreError::Decode("tree entry name not a string".into()))?
                        .to_string(),
                );
            }
            2 => {
                let raw = val
                    .as_u64()
                    .ok_or_else(|| StoreError::Decode("tree entry kind not an integer".into()))?;
                kind = Some(EntryKind::from_u8(raw as u8)?);
            }
            3 => {
                mode = val
                    .as_u64()
                    .ok_or_else(|| StoreError::Decode("tree entry mode not an integer".into()))?
                    as u32;
            }
            4 => {
                size = val
                    .as_u64()
                    .ok_or_else(|| StoreError::Decode("tree entry size not an integer".into()))?;
            }
            5 => {
                let bytes = match val {
                    Value::Binary(b) => b.as_slice(),
                    _ => return Err(StoreError::Decode("tree entry hash not binary".into())),
                };
                if bytes.len() != 32 {
                    return Err(StoreError::Decode(format!(
                        "tree entry hash is {} bytes, want 32",
                        bytes.len()
                    )));
                }
                let mut arr = [0u8; 32];
                arr.copy_from_slice(bytes);
                hash = Some(arr);
            }
            _ => {} // unknown tags tolerated for forward compatibility
        }
    }

    Ok(TreeEntry {
        name: name.ok_or_else(|| StoreError::Decode("tree entry missing name".into()))?,
        kind: kind.ok_or_else(|| StoreError::Decode("tree entry missing kind".into()))?,
        mode,
        size,
        hash: hash.ok_or_else(|| StoreError::Decode("tree entry missing hash".into()))?,
    })
}

/// Integer keys or digit-string keys normalize to the same tag.
pub fn numeric_tag(key: &Value) -> Option<u64> {
    match key {
        Value::Integer(i) => i.as_u64(),
        Value::String(s) => s.as_str().and_then(|s| s.parse().ok()),
        _ => None,
    }
}

/// Resolve `path` under `root`, loading tree and file blobs through `load`.
/// An empty path locates the root directory.
pub fn walk(
    load: impl Fn(&[u8; 32]) -> Result<Vec<u8>>,
    root: [u8; 32],
    path: &str,
) -> Result<Located> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    let mut entries = decode_tree(&load(&root)?)?;

    for (i, segment) in segments.iter().enumerate() {
        let entry = entries
            .iter()
            .find(|e| e.name == *segment)
            .cloned()
            .ok_or_else(|| StoreError::NotFound(format!("fs path {path}")))?;
        let last = i + 1 == segments.len();
        match entry.kind {
            EntryKind::Directory => {
                entries = decode_tree(&load(&entry.hash)?)?;
                if last {
                    return Ok(Located::Directory(entries));
                }
            }
            EntryKind::File | EntryKind::Symlink => {
                if !last {
                    return Err(StoreError::NotFound(format!("fs path {path}")));
                }
                let content = load(&entry.hash)?;
                return Ok(Located::File { entry, content });
            }
        }
    }
    Ok(Located::Directory(entries))
}
