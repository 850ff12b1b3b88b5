//! The two-level virtual directory tree synthesized over the manifest's
//! domain strings. A domain splits at its first `-` into a top-level
//! segment and a subdomain (`AppDomain-com.example.app`); domains without
//! a dash are leaves (`HomeDomain`).

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use crate::error::Result;
use crate::manifest::Manifest;

#[derive(Debug)]
pub enum DomainNode {
    /// Domain with no subdomains; its children come straight from the
    /// manifest rows.
    Leaf,
    Subdomains(BTreeSet<String>),
}

/// Derived once at mount and read-only thereafter. BTree containers keep
/// listings deterministic.
#[derive(Debug, Default)]
pub struct DomainTree {
    tops: BTreeMap<String, DomainNode>,
}

impl DomainTree {
    pub fn build(manifest: &Manifest) -> Result<Self> {
        Ok(Self::from_domains(manifest.distinct_domains()?))
    }

    fn from_domains(domains: impl IntoIterator<Item = String>) -> Self {
        let mut tops: BTreeMap<String, DomainNode> = BTreeMap::new();
        for domain in domains {
            match domain.split_once('-') {
                None => {
                    tops.entry(domain).or_insert(DomainNode::Leaf);
                }
                Some((top, rest)) => {
                    let node = tops
                        .entry(top.to_string())
                        .or_insert_with(|| DomainNode::Subdomains(BTreeSet::new()));
                    if matches!(node, DomainNode::Leaf) {
                        *node = DomainNode::Subdomains(BTreeSet::new());
                    }
                    if let DomainNode::Subdomains(subs) = node {
                        subs.insert(rest.to_string());
                    }
                }
            }
        }
        debug!(tops = tops.len(), "domain tree built");
        Self { tops }
    }

    pub fn get(&self, top: &str) -> Option<&DomainNode> {
        self.tops.get(top)
    }

    pub fn top_level(&self) -> impl Iterator<Item = &str> {
        self.tops.keys().map(String::as_str)
    }
}
