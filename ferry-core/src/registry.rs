//! Source registry: the closed universe of `(node, share)` pairs and a
//! read-only probe telling which of them currently expose the project.
//!
//! # Path layout
//!
//! ```text
//! <source_template with {node} and {share} substituted>/
//!   <project>/            (SourceRoot::path)
//! ```
//!
//! Sources are never auto-discovered. An unreachable share, a missing project
//! directory, or a permission error all mean "not available right now".

use std::collections::BTreeSet;
use std::path::PathBuf;

use crate::config::SyncConfig;
use crate::types::{NodeName, ProjectName, ShareName, SourceKey, SourceRoot};

/// Fixed set of sources built from the configured node and share lists.
#[derive(Debug, Clone)]
pub struct SourceRegistry {
    nodes: Vec<NodeName>,
    shares: Vec<ShareName>,
    template: String,
}

impl SourceRegistry {
    pub fn new(nodes: Vec<NodeName>, shares: Vec<ShareName>, template: impl Into<String>) -> Self {
        Self {
            nodes,
            shares,
            template: template.into(),
        }
    }

    pub fn from_config(config: &SyncConfig) -> Self {
        Self::new(
            config.nodes.clone(),
            config.shares.clone(),
            config.source_template.clone(),
        )
    }

    /// Number of registered sources, online or not.
    pub fn len(&self) -> usize {
        self.nodes.len() * self.shares.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Every registered source, ordered by node then share.
    ///
    /// The project is accepted for symmetry with [`resolve`](Self::resolve);
    /// the universe does not depend on it.
    pub fn discover(&self, _project: &ProjectName) -> BTreeSet<SourceKey> {
        self.nodes
            .iter()
            .flat_map(|node| {
                self.shares
                    .iter()
                    .map(move |share| SourceKey::new(node.clone(), share.clone()))
            })
            .collect()
    }

    /// `<template>/<project>` for `key`; pure, no I/O.
    pub fn root_path(&self, key: &SourceKey, project: &ProjectName) -> PathBuf {
        let share_root = self
            .template
            .replace("{node}", &key.node.0)
            .replace("{share}", &key.share.0);
        PathBuf::from(share_root).join(&project.0)
    }

    /// The project root for `key` if it exists and can be listed right now.
    pub fn resolve(&self, key: &SourceKey, project: &ProjectName) -> Option<SourceRoot> {
        let path = self.root_path(key, project);
        let meta = std::fs::metadata(&path).ok()?;
        if !meta.is_dir() {
            return None;
        }
        // A directory we cannot enumerate is as good as absent.
        std::fs::read_dir(&path).ok()?;
        Some(SourceRoot {
            key: key.clone(),
            project: project.clone(),
            path,
        })
    }

    /// Every source that resolves this instant, in key order.
    pub fn available(&self, project: &ProjectName) -> Vec<SourceRoot> {
        self.discover(project)
            .iter()
            .filter_map(|key| self.resolve(key, project))
            .collect()
    }
}

// ---------------------------------------------------------------------------
// Unit tests
// ---------------------------------------------------------------------------
