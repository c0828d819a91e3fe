//! Per-invocation scratch directory carrying the call in and the outcome out.
//!
//! ```text
//! <scratch_root>/
//! └── <uuid v4>/
//!     ├── input.b    # CallDescription, written by the parent
//!     └── output.b   # OutcomeEnvelope, written by the child
//! ```
//!
//! Both files are written to a `.tmp` sibling first and renamed into place, so
//! a reader sees either nothing or a complete blob.

use std::fs::{self, File};
use std::io::{BufReader, ErrorKind, Write};
use std::path::{Path, PathBuf};

use uuid::Uuid;

use crate::codec::Serializer;
use crate::error::{Error, Result};

use super::protocol::{CallDescription, OutcomeEnvelope, read_blob, write_blob};

/// Environment variable carrying the input path to the child.
pub const INPUT_FILE_ENV: &str = "TIMEBOX_INPUT_FILE";

const INPUT_FILE: &str = "input.b";
const OUTPUT_FILE: &str = "output.b";

/// The two files exchanged with one child process.
#[derive(Debug, Clone)]
pub struct CallChannel {
    id: Uuid,
    dir: PathBuf,
    input: PathBuf,
    output: PathBuf,
}

impl CallChannel {
    /// Allocate a fresh, uniquely named directory under `root`.
    ///
    /// `root` is created if missing; the per-invocation directory is created
    /// with `create_dir` so an existing directory is an error, never shared.
    pub fn create(root: &Path) -> Result<Self> {
        fs::create_dir_all(root)?;
        let channel = Self::layout(root);
        fs::create_dir(&channel.dir)?;
        Ok(channel)
    }

    fn layout(root: &Path) -> Self {
        let id = Uuid::new_v4();
        let dir = root.join(id.to_string());
        Self {
            id,
            input: dir.join(INPUT_FILE),
            output: dir.join(OUTPUT_FILE),
            dir,
        }
    }

    /// Unique id of this invocation.
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// The scratch directory.
    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Path of the call description.
    pub fn input(&self) -> &Path {
        &self.input
    }

    /// Path of the outcome envelope.
    pub fn output(&self) -> &Path {
        &self.output
    }

    /// Encode and atomically write the call description.
    pub fn write_input(&self, serializer: &dyn Serializer, call: &CallDescription) -> Result<()> {
        let mut bytes = Vec::new();
        write_blob(&mut bytes, serializer, call)?;
        write_atomic(&self.input, &bytes)
    }

    /// Whether the child has published an outcome.
    pub fn has_outcome(&self) -> bool {
        self.output.exists()
    }

    /// Read the outcome, or `None` if the child never wrote one.
    pub fn read_outcome(&self, serializer: &dyn Serializer) -> Result<Option<OutcomeEnvelope>> {
        let file = match File::open(&self.output) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(Error::Io(e)),
        };
        let envelope = read_blob(&mut BufReader::new(file), serializer)?;
        Ok(Some(envelope))
    }

    /// Remove the scratch directory and everything in it.
    ///
    /// Missing directories are not an error.
    pub fn cleanup(&self) -> Result<()> {
        match fs::remove_dir_all(&self.dir) {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(()),
            Err(e) => Err(Error::Io(e)),
        }
    }
}

/// Read the call description handed to a child.
pub fn read_input(path: &Path, serializer: &dyn Serializer) -> Result<CallDescription> {
    let file = File::open(path)?;
    read_blob(&mut BufReader::new(file), serializer)
}

/// Encode and atomically write an outcome envelope.
pub fn write_outcome(
    path: &Path,
    serializer: &dyn Serializer,
    envelope: &OutcomeEnvelope,
) -> Result<()> {
    let mut bytes = Vec::new();
    write_blob(&mut bytes, serializer, envelope)?;
    write_atomic(path, &bytes)
}

/// Write `bytes` to a temporary sibling, fsync it, then rename it over `path`.
pub fn write_atomic(path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = tmp_path(path);
    {
        let mut file = File::create(&tmp)?;
        file.write_all(bytes)?;
        file.sync_all()?;
    }
    fs::rename(&tmp, path)?;
    Ok(())
}

fn tmp_path(path: &Path) -> PathBuf {
    let mut name = path
        .file_name()
        .map(|n| n.to_os_string())
        .unwrap_or_default();
    name.push(".tmp");
    path.with_file_name(name)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::codec::JsonSerializer;
    use crate::ipc::protocol::Arguments;
    use serde_json::json;
    use tempfile::TempDir;

    fn call_for(channel: &CallChannel) -> CallDescription {
        CallDescription {
            function: "add".to_string(),
            arguments: Arguments::new().arg(1).arg(2),
            output: channel.output().to_path_buf(),
            initializer: None,
        }
    }

    #[test]
    fn test_create_layout() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let channel = CallChannel::create(&temp.path().join("timebox")).unwrap();

        assert!(channel.dir().is_dir());
        assert_eq!(channel.input().parent(), Some(channel.dir()));
        assert!(channel.dir().ends_with(channel.id().to_string()));
        assert!(!channel.has_outcome());
    }

    #[test]
    fn test_channels_do_not_collide() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let a = CallChannel::create(temp.path()).unwrap();
        let b = CallChannel::create(temp.path()).unwrap();
        assert_ne!(a.dir(), b.dir());
    }

    #[test]
    fn test_input_roundtrip_leaves_no_tmp() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let channel = CallChannel::create(temp.path()).unwrap();
        let call = call_for(&channel);

        channel.write_input(&JsonSerializer, &call).unwrap();
        assert_eq!(read_input(channel.input(), &JsonSerializer).unwrap(), call);

        let names: Vec<_> = fs::read_dir(channel.dir())
            .unwrap()
            .map(|e| e.unwrap().file_name().to_string_lossy().to_string())
            .collect();
        assert_eq!(names, vec!["input.b".to_string()]);
    }

    #[test]
    fn test_missing_outcome_is_none() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let channel = CallChannel::create(temp.path()).unwrap();
        assert!(channel.read_outcome(&JsonSerializer).unwrap().is_none());
    }

    #[test]
    fn test_outcome_roundtrip_and_cleanup() {
        let temp = TempDir::new().expect("Failed to create temp dir");
        let channel = CallChannel::create(temp.path()).unwrap();

        let envelope = OutcomeEnvelope::Success(json!([1, 2]));
        write_outcome(channel.output(), &JsonSerializer, &envelope).unwrap();
        assert!(channel.has_outcome());
        assert_eq!(channel.read_outcome(&JsonSerializer).unwrap(), Some(envelope));

        channel.cleanup().unwrap();
        assert!(!channel.dir().exists());
        // Second cleanup is a no-op
        channel.cleanup().unwrap();
    }
}
