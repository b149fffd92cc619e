//! Resource inventory filtering.

use log::{debug, warn};
use regex::Regex;
use skirmish_core::{CancelToken, Exclude, Resource};
use std::collections::BTreeMap;

use crate::backend::{ComputeBackend, InstanceRecord};
use crate::catalog::Catalog;
use crate::error::CloudError;

/// Last path segment of a zone URL, or the input unchanged.
pub fn zone_name(raw: &str) -> &str {
    raw.rsplit('/').next().unwrap_or(raw)
}

/// `us-east1-b` belongs to `us-east1`.
pub fn region_of(zone: &str) -> &str {
    match zone.rfind('-') {
        Some(index) => &zone[..index],
        None => zone,
    }
}

/// Exclusion rules with wildcards compiled once.
#[derive(Debug, Clone)]
pub struct ExclusionRules {
    labels: BTreeMap<String, String>,
    zones: Vec<String>,
    regions: Vec<String>,
    wildcards: Vec<Regex>,
}

impl ExclusionRules {
    /// Patterns that fail to compile are dropped and never exclude anything.
    pub fn compile(exclude: &Exclude) -> Self {
        let wildcards = exclude
            .wildcards
            .iter()
            .filter_map(|pattern| match Regex::new(pattern) {
                Ok(regex) => Some(regex),
                Err(err) => {
                    warn!("ignoring exclusion wildcard '{pattern}': {err}");
                    None
                }
            })
            .collect();
        Self {
            labels: exclude.labels.clone(),
            zones: exclude.zones.clone(),
            regions: exclude.regions.clone(),
            wildcards,
        }
    }

    pub fn excludes_zone(&self, zone: &str) -> bool {
        let region = region_of(zone);
        self.zones.iter().any(|prefix| zone.starts_with(prefix.as_str()))
            || self
                .regions
                .iter()
                .any(|prefix| region.starts_with(prefix.as_str()))
    }

    pub fn excludes(&self, name: &str, zone: &str, labels: &BTreeMap<String, String>) -> bool {
        self.wildcards.iter().any(|regex| regex.is_match(name))
            || self.excludes_zone(zone)
            || self
                .labels
                .iter()
                .any(|(key, value)| labels.get(key) == Some(value))
    }
}

fn to_resource(project: &str, record: InstanceRecord) -> Resource {
    let zone = zone_name(&record.zone).to_string();
    let region = region_of(&zone).to_string();
    Resource {
        id: record.id,
        name: record.name,
        zone,
        region,
        project: project.to_string(),
        status: record.status,
        labels: record.labels,
    }
}

/// Every unexcluded instance across `projects` × the catalog's zones, in
/// listing order. Any listing error aborts the whole filter.
pub fn filter_resources(
    backend: &dyn ComputeBackend,
    catalog: &Catalog,
    projects: &[String],
    exclude: &Exclude,
    cancel: &CancelToken,
) -> Result<Vec<Resource>, CloudError> {
    let rules = ExclusionRules::compile(exclude);
    let mut resources = Vec::new();

    for project in projects {
        for zone in &catalog.zones {
            if rules.excludes_zone(zone) {
                debug!("skipping excluded zone {project}/{zone}");
                continue;
            }
            let mut page_token: Option<String> = None;
            loop {
                if cancel.is_cancelled() {
                    return Err(CloudError::Cancelled);
                }
                let page = backend.list_instances(project, zone, page_token.as_deref())?;
                for record in page.items {
                    if rules.excludes(&record.name, zone_name(&record.zone), &record.labels) {
                        debug!("excluding {project}/{}", record.name);
                        continue;
                    }
                    resources.push(to_resource(project, record));
                }
                match page.next_page_token {
                    Some(token) if !token.is_empty() => page_token = Some(token),
                    _ => break,
                }
            }
        }
    }

    Ok(resources)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::MemoryBackend;

    fn mk_exclude() -> Exclude {
        Exclude::default()
    }

    fn mk_fixture() -> (MemoryBackend, Catalog) {
        let backend = MemoryBackend::new();
        backend.add_instance("prod", "us-east1-b", "web-1", &[("tier", "web")]);
        backend.add_instance("prod", "us-east4-a", "db-1", &[("tier", "db")]);
        backend.add_instance("prod", "us-west1-b", "bastion-1", &[]);
        backend.add_instance("prod", "us-west1-b", "web-2", &[]);
        let catalog = Catalog::load(&backend, &["prod".to_string()]).expect("catalog");
        (backend, catalog)
    }

    fn names(resources: &[Resource]) -> Vec<&str> {
        resources.iter().map(|resource| resource.name.as_str()).collect()
    }

    #[test]
    fn zone_and_region_helpers() {
        assert_eq!(
            zone_name("https://www.googleapis.com/compute/v1/projects/p/zones/us-east1-b"),
            "us-east1-b"
        );
        assert_eq!(zone_name("us-east1-b"), "us-east1-b");
        assert_eq!(region_of("us-east1-b"), "us-east1");
        assert_eq!(region_of("local"), "local");
    }

    #[test]
    fn no_rules_keeps_everything_in_listing_order() {
        let (backend, catalog) = mk_fixture();
        let resources = filter_resources(
            &backend,
            &catalog,
            &["prod".to_string()],
            &mk_exclude(),
            &CancelToken::new(),
        )
        .expect("filter");
        assert_eq!(resources.len(), 4);
        let web = resources
            .iter()
            .find(|resource| resource.name == "web-1")
            .expect("web-1");
        assert_eq!(web.zone, "us-east1-b");
        assert_eq!(web.region, "us-east1");
        assert_eq!(web.project, "prod");
    }

    #[test]
    fn zone_prefix_excludes_every_matching_zone() {
        let (backend, catalog) = mk_fixture();
        let mut exclude = mk_exclude();
        exclude.zones.push("us-east".to_string());
        let resources = filter_resources(
            &backend,
            &catalog,
            &["prod".to_string()],
            &exclude,
            &CancelToken::new(),
        )
        .expect("filter");
        assert!(resources.iter().all(|resource| resource.zone == "us-west1-b"));
        assert_eq!(names(&resources), vec!["bastion-1", "web-2"]);
    }

    #[test]
    fn any_rule_category_excludes() {
        let (backend, catalog) = mk_fixture();
        let mut exclude = mk_exclude();
        exclude.wildcards.push("^bastion-".to_string());
        exclude.labels.insert("tier".to_string(), "db".to_string());
        exclude.regions.push("us-east1".to_string());
        let resources = filter_resources(
            &backend,
            &catalog,
            &["prod".to_string()],
            &exclude,
            &CancelToken::new(),
        )
        .expect("filter");
        assert_eq!(names(&resources), vec!["web-2"]);
    }

    #[test]
    fn label_rule_needs_matching_value() {
        let rules = ExclusionRules::compile(&Exclude {
            labels: BTreeMap::from([("tier".to_string(), "db".to_string())]),
            ..Exclude::default()
        });
        let web = BTreeMap::from([("tier".to_string(), "web".to_string())]);
        let db = BTreeMap::from([("tier".to_string(), "db".to_string())]);
        assert!(!rules.excludes("a", "us-east1-b", &web));
        assert!(rules.excludes("a", "us-east1-b", &db));
    }

    #[test]
    fn malformed_wildcard_never_excludes() {
        let rules = ExclusionRules::compile(&Exclude {
            wildcards: vec!["web-[".to_string(), "^db-".to_string()],
            ..Exclude::default()
        });
        assert!(!rules.excludes("web-[", "us-east1-b", &BTreeMap::new()));
        assert!(rules.excludes("db-7", "us-east1-b", &BTreeMap::new()));
    }

    #[test]
    fn paging_collects_all_pages() {
        let (backend, catalog) = mk_fixture();
        backend.set_page_size(1);
        let resources = filter_resources(
            &backend,
            &catalog,
            &["prod".to_string()],
            &mk_exclude(),
            &CancelToken::new(),
        )
        .expect("filter");
        assert_eq!(resources.len(), 4);
    }

    #[test]
    fn listing_error_discards_partial_results() {
        let (backend, catalog) = mk_fixture();
        backend.fail_listing("prod", "us-west1-b");
        let err = filter_resources(
            &backend,
            &catalog,
            &["prod".to_string()],
            &mk_exclude(),
            &CancelToken::new(),
        )
        .expect_err("listing failure");
        assert!(matches!(err, CloudError::Backend(_)));
    }

    #[test]
    fn cancelled_run_stops_filtering() {
        let (backend, catalog) = mk_fixture();
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = filter_resources(&backend, &catalog, &["prod".to_string()], &mk_exclude(), &cancel)
            .expect_err("cancelled");
        assert!(matches!(err, CloudError::Cancelled));
    }
}
