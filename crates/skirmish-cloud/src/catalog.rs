use log::debug;
use std::collections::BTreeSet;

use crate::backend::ComputeBackend;
use crate::error::BackendError;

/// Zones and regions visible to a project set. Read-only once loaded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Catalog {
    pub zones: Vec<String>,
    pub regions: Vec<String>,
}

impl Catalog {
    /// Union of every project's zones and regions, sorted.
    pub fn load(backend: &dyn ComputeBackend, projects: &[String]) -> Result<Self, BackendError> {
        let mut zones = BTreeSet::new();
        let mut regions = BTreeSet::new();
        for project in projects {
            zones.extend(backend.list_zones(project)?);
            regions.extend(backend.list_regions(project)?);
        }
        debug!(
            "loaded catalog for {} project(s): {} zone(s), {} region(s)",
            projects.len(),
            zones.len(),
            regions.len()
        );
        Ok(Self {
            zones: zones.into_iter().collect(),
            regions: regions.into_iter().collect(),
        })
    }
}
