//! Local roster sources feeding the reconciliation run.

use std::collections::HashSet;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use async_trait::async_trait;
use memsync_core::LocalMember;
use serde::{de::DeserializeOwned, Deserialize};
use thiserror::Error;
use tracing::{info, warn};
use uuid::Uuid;

pub const CRATE_NAME: &str = "memsync-roster";

#[derive(Debug, Error)]
pub enum RosterError {
    #[error("duplicate member id {0} in roster")]
    DuplicateId(Uuid),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

/// Read-only access to the locally managed members.
#[async_trait]
pub trait RosterSource: Send + Sync {
    fn source_id(&self) -> &str;

    async fn load(&self) -> Result<Vec<LocalMember>, RosterError>;
}

/// Roster export on disk: either `{"members": [...]}` or a bare array.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
enum RosterFile {
    Export {
        #[serde(default)]
        exported_at: Option<String>,
        members: Vec<LocalMember>,
    },
    Bare(Vec<LocalMember>),
}

#[derive(Debug, Clone)]
pub struct JsonFileRoster {
    path: PathBuf,
}

impl JsonFileRoster {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl RosterSource for JsonFileRoster {
    fn source_id(&self) -> &str {
        "json-file"
    }

    async fn load(&self) -> Result<Vec<LocalMember>, RosterError> {
        let file: RosterFile = read_json_file(&self.path)?;
        let members = match file {
            RosterFile::Export {
                exported_at,
                members,
            } => {
                info!(
                    path = %self.path.display(),
                    exported_at = exported_at.as_deref().unwrap_or("unknown"),
                    members = members.len(),
                    "loaded roster export"
                );
                members
            }
            RosterFile::Bare(members) => members,
        };
        validate_roster(&members)?;
        Ok(members)
    }
}

/// Members handed over directly, e.g. by an embedding application.
#[derive(Debug, Clone, Default)]
pub struct InMemoryRoster {
    members: Vec<LocalMember>,
}

impl InMemoryRoster {
    pub fn new(members: Vec<LocalMember>) -> Self {
        Self { members }
    }
}

#[async_trait]
impl RosterSource for InMemoryRoster {
    fn source_id(&self) -> &str {
        "in-memory"
    }

    async fn load(&self) -> Result<Vec<LocalMember>, RosterError> {
        validate_roster(&self.members)?;
        Ok(self.members.clone())
    }
}

pub fn validate_roster(members: &[LocalMember]) -> Result<(), RosterError> {
    let mut seen = HashSet::new();
    for member in members {
        if !seen.insert(member.id) {
            return Err(RosterError::DuplicateId(member.id));
        }
        if member.birth_date.is_none() {
            warn!(
                member = %member.full_name(),
                "member has no birth date; it only reaches last-resort matching and cannot be written remotely"
            );
        }
    }
    Ok(())
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}
