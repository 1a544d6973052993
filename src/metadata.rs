//! Read-only metadata store boundary.
//!
//! Experiment, phenotyper, and accession reference data live in the
//! application's database, which is outside this crate. The orchestrator
//! only ever reads from it, through this narrow trait, to validate a
//! [`ScanRequest`](crate::scan::ScanRequest) before any hardware is touched.

use crate::error::ScanResult;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::RwLock;

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Experiment {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub species: Option<String>,
}

#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Phenotyper {
    pub id: String,
    pub name: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
}

/// Read-only lookups against the reference-data store.
#[async_trait]
pub trait MetadataStore: Send + Sync {
    async fn experiment(&self, id: &str) -> ScanResult<Option<Experiment>>;
    async fn phenotyper(&self, id: &str) -> ScanResult<Option<Phenotyper>>;
    /// Accession name registered for a plant barcode, if any.
    async fn accession_name(&self, plant_barcode: &str) -> ScanResult<Option<String>>;
}

/// In-memory store used by tests and the CLI demo mode.
#[derive(Default)]
pub struct InMemoryMetadataStore {
    experiments: RwLock<HashMap<String, Experiment>>,
    phenotypers: RwLock<HashMap<String, Phenotyper>>,
    accessions: RwLock<HashMap<String, String>>,
}

impl InMemoryMetadataStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert_experiment(&self, experiment: Experiment) {
        if let Ok(mut map) = self.experiments.write() {
            map.insert(experiment.id.clone(), experiment);
        }
    }

    pub fn insert_phenotyper(&self, phenotyper: Phenotyper) {
        if let Ok(mut map) = self.phenotypers.write() {
            map.insert(phenotyper.id.clone(), phenotyper);
        }
    }

    pub fn insert_accession(&self, plant_barcode: impl Into<String>, name: impl Into<String>) {
        if let Ok(mut map) = self.accessions.write() {
            map.insert(plant_barcode.into(), name.into());
        }
    }

    /// Store preloaded with the ids of one sample request, for tests and the
    /// CLI demo.
    pub fn with_sample_data() -> Self {
        let store = Self::new();
        store.insert_experiment(Experiment {
            id: "EXP-042".to_string(),
            name: "Salt stress time course".to_string(),
            species: Some("Arabidopsis thaliana".to_string()),
        });
        store.insert_phenotyper(Phenotyper {
            id: "PH-7".to_string(),
            name: "J. Moreno".to_string(),
            email: None,
        });
        store.insert_accession("PLT-000123", "Col-0");
        store
    }
}

#[async_trait]
impl MetadataStore for InMemoryMetadataStore {
    async fn experiment(&self, id: &str) -> ScanResult<Option<Experiment>> {
        Ok(self
            .experiments
            .read()
            .ok()
            .and_then(|map| map.get(id).cloned()))
    }

    async fn phenotyper(&self, id: &str) -> ScanResult<Option<Phenotyper>> {
        Ok(self
            .phenotypers
            .read()
            .ok()
            .and_then(|map| map.get(id).cloned()))
    }

    async fn accession_name(&self, plant_barcode: &str) -> ScanResult<Option<String>> {
        Ok(self
            .accessions
            .read()
            .ok()
            .and_then(|map| map.get(plant_barcode).cloned()))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_lookup_round_trip() {
        let store = InMemoryMetadataStore::with_sample_data();
        let experiment = store.experiment("EXP-042").await.expect("lookup");
        assert_eq!(
            experiment.map(|e| e.name),
            Some("Salt stress time course".to_string())
        );
        assert!(store.experiment("EXP-999").await.expect("lookup").is_none());

        let accession = store.accession_name("PLT-000123").await.expect("lookup");
        assert_eq!(accession.as_deref(), Some("Col-0"));
    }
}
