use std::fs;
use std::io::{self, BufWriter, Write};
use std::path::{Component, Path, PathBuf};

use walkdir::WalkDir;

use crate::collab::{ByteStream, ObjectStore};
use crate::error::{Error, Result};
use crate::store::object_name;

/// Keys as relative paths under a directory.
#[derive(Debug, Clone)]
pub struct LocalStore {
    root: PathBuf,
}

impl LocalStore {
    pub fn new(root: impl AsRef<Path>) -> Result<Self> {
        let root = root.as_ref().to_path_buf();
        fs::create_dir_all(&root)
            .map_err(|e| Error::msg(format!("failed to create {}: {e}", root.display())))?;
        Ok(Self { root })
    }

    fn path_for(&self, key: &str) -> Result<PathBuf> {
        let name = object_name(key);
        let rel = Path::new(name);
        if name.is_empty() || rel.components().any(|c| !matches!(c, Component::Normal(_))) {
            return Err(Error::msg(format!("invalid object key '{key}'")));
        }
        Ok(self.root.join(rel))
    }
}

impl ObjectStore for LocalStore {
    fn list_keys(&self, prefix: &str) -> Result<Vec<String>> {
        let prefix = object_name(prefix);
        let mut keys = Vec::new();
        for entry in WalkDir::new(&self.root).follow_links(false) {
            let entry =
                entry.map_err(|e| Error::msg(format!("failed to list {}: {e}", self.root.display())))?;
            if !entry.file_type().is_file() {
                continue;
            }
            let name = entry.file_name().to_string_lossy();
            // in-flight writes
            if name.starts_with('.') && name.contains(".part.") {
                continue;
            }
            let rel = entry
                .path()
                .strip_prefix(&self.root)
                .map_err(|e| Error::msg(format!("unexpected path {}: {e}", entry.path().display())))?;
            let key = rel
                .components()
                .map(|c| c.as_os_str().to_string_lossy())
                .collect::<Vec<_>>()
                .join("/");
            if key.starts_with(prefix) {
                keys.push(key);
            }
        }
        keys.sort();
        Ok(keys)
    }

    fn put_object(&self, key: &str, mut body: ByteStream) -> Result<()> {
        let dest = self.path_for(key)?;
        if let Some(parent) = dest.parent() {
            fs::create_dir_all(parent)
                .map_err(|e| Error::msg(format!("failed to create {}: {e}", parent.display())))?;
        }
        let file_name = dest
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let tmp = dest.with_file_name(format!(".{file_name}.part.{}", std::process::id()));

        let written = (|| -> io::Result<()> {
            let mut out = BufWriter::new(fs::File::create(&tmp)?);
            io::copy(&mut body, &mut out)?;
            out.flush()
        })();
        if let Err(e) = written {
            let _ = fs::remove_file(&tmp);
            return Err(Error::msg(format!("failed to store {key}: {e}")));
        }
        fs::rename(&tmp, &dest)
            .map_err(|e| Error::msg(format!("failed to store {key}: {e}")))
    }

    fn get_object(&self, key: &str) -> Result<ByteStream> {
        let path = self.path_for(key)?;
        let file = fs::File::open(&path)
            .map_err(|e| Error::msg(format!("failed to open {}: {e}", path.display())))?;
        Ok(Box::new(file))
    }
}
