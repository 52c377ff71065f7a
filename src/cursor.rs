use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Resume point against one server: the session and the last snapshot cursor.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub sessionid: String,
    #[serde(default)]
    pub last_snap: Option<i64>,
}

#[derive(Debug, Clone)]
pub struct CursorFile {
    path: PathBuf,
}

impl CursorFile {
    pub fn for_host(state_dir: &Path, host: &str) -> Self {
        Self {
            path: state_dir.join(format!("{host}.session.json")),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// A missing or unparsable file means "start with a new session".
    pub fn load(&self) -> Result<Option<Cursor>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let raw = fs::read_to_string(&self.path)
            .with_context(|| format!("read cursor {}", self.path.display()))?;
        match serde_json::from_str::<Cursor>(&raw) {
            Ok(cursor) if !cursor.sessionid.is_empty() => Ok(Some(cursor)),
            Ok(_) => Ok(None),
            Err(err) => {
                tracing::warn!(path = %self.path.display(), error = %err, "ignoring unparsable cursor file");
                Ok(None)
            }
        }
    }

    pub fn save(&self, cursor: &Cursor) -> Result<()> {
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, serde_json::to_string_pretty(cursor)?).context("write cursor tmp")?;
        fs::rename(&tmp, &self.path).context("rename cursor")?;
        Ok(())
    }
}
