//! Working-tree snapshots for rollback at the GREEN boundary.

use anyhow::{Context, Result};
use git2::build::CheckoutBuilder;
use git2::{Repository, ResetType, Signature};
use std::path::Path;
use std::sync::Mutex;

/// Capture/restore point for a project working tree. The machine captures
/// once per GREEN boundary and rolls back on every refactor regression.
pub trait Snapshotter: Send + Sync {
    /// Snapshot the current tree; returns an opaque reference.
    fn capture(&self, label: &str) -> Result<String>;
    /// Restore the tree to a previously captured reference.
    fn rollback(&self, reference: &str) -> Result<()>;
}

pub struct GitSnapshotter {
    repo: Mutex<Repository>,
}

impl GitSnapshotter {
    pub fn new(project_dir: &Path) -> Result<Self> {
        let repo = Repository::open(project_dir).context("Failed to open git repository")?;
        Ok(Self {
            repo: Mutex::new(repo),
        })
    }
}

impl Snapshotter for GitSnapshotter {
    fn capture(&self, label: &str) -> Result<String> {
        let repo = self.repo.lock().map_err(|_| anyhow::anyhow!("snapshot lock poisoned"))?;
        let mut index = repo.index()?;

        index.add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)?;
        index.write()?;

        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;

        let sig = Signature::now("vigil", "vigil@localhost")?;
        let message = format!("[vigil] snapshot {label}");

        // Handle unborn branch (new repo with no commits yet)
        let head = repo.head().ok().and_then(|h| h.peel_to_commit().ok());
        let commit_id = match head {
            Some(parent) => repo.commit(Some("HEAD"), &sig, &sig, &message, &tree, &[&parent])?,
            None => repo.commit(Some("HEAD"), &sig, &sig, &message, &tree, &[])?,
        };

        Ok(commit_id.to_string())
    }

    fn rollback(&self, reference: &str) -> Result<()> {
        let repo = self.repo.lock().map_err(|_| anyhow::anyhow!("snapshot lock poisoned"))?;
        let oid = git2::Oid::from_str(reference)
            .with_context(|| format!("Invalid snapshot reference: {reference}"))?;
        let commit = repo
            .find_commit(oid)
            .with_context(|| format!("Snapshot commit not found: {reference}"))?;

        repo.reset(commit.as_object(), ResetType::Hard, None)
            .context("Failed to reset working tree to snapshot")?;
        // A hard reset overrides the checkout strategy, so files created
        // after the snapshot survive it; a forced checkout removes them.
        let mut checkout = CheckoutBuilder::new();
        checkout.force().remove_untracked(true);
        repo.checkout_head(Some(&mut checkout))
            .context("Failed to clean working tree after reset")?;
        Ok(())
    }
}

/// In-memory snapshotter for machine tests.
#[derive(Debug, Default)]
pub struct MemorySnapshotter {
    captures: Mutex<Vec<String>>,
    rollbacks: Mutex<Vec<String>>,
}

impl MemorySnapshotter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn rollbacks(&self) -> Vec<String> {
        self.rollbacks.lock().expect("snapshot mutex poisoned").clone()
    }
}

impl Snapshotter for MemorySnapshotter {
    fn capture(&self, label: &str) -> Result<String> {
        let mut captures = self.captures.lock().expect("snapshot mutex poisoned");
        let reference = format!("mem-{}-{}", captures.len(), label);
        captures.push(reference.clone());
        Ok(reference)
    }

    fn rollback(&self, reference: &str) -> Result<()> {
        self.rollbacks
            .lock()
            .expect("snapshot mutex poisoned")
            .push(reference.to_string());
        Ok(())
    }
}
