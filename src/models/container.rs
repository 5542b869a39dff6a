//! Containers: the physical files holding one or more datasets.

use uuid::Uuid;

use super::dataset::{Dataset, DatasetStatus};
use super::persistence_state::PersistenceState;
use crate::error::{CatalogError, Result};

#[derive(Debug, Clone, PartialEq)]
pub struct Container {
    pub uri: String,
    /// Managed containers were written by a consolidation and are owned by the catalog.
    pub managed: bool,
    pub storage_class: String,
    pub datasets: Vec<Dataset>,
    pub persistence: PersistenceState,
}

impl Container {
    pub fn new(uri: impl Into<String>, managed: bool, storage_class: impl Into<String>) -> Self {
        Self {
            uri: uri.into(),
            managed,
            storage_class: storage_class.into(),
            datasets: Vec::new(),
            persistence: PersistenceState::New,
        }
    }

    /// Rebuilds a container loaded from the database.
    pub fn restore(
        uri: String,
        managed: bool,
        storage_class: String,
        datasets: Vec<Dataset>,
    ) -> Self {
        Self {
            uri,
            managed,
            storage_class,
            datasets,
            persistence: PersistenceState::Clean,
        }
    }

    pub fn add_dataset(&mut self, mut dataset: Dataset) {
        dataset.container_uri = self.uri.clone();
        self.datasets.push(dataset);
    }

    /// Drops a dataset. One that was never saved simply disappears.
    pub fn remove_dataset(&mut self, dataset_id: Uuid) -> Result<()> {
        let position = self
            .datasets
            .iter()
            .position(|d| d.id == dataset_id)
            .ok_or_else(|| CatalogError::not_found("dataset", dataset_id))?;
        if self.datasets[position].persistence.is_new() {
            self.datasets.remove(position);
        } else {
            self.datasets[position].persistence.mark_to_delete();
        }
        Ok(())
    }

    /// Datasets that will survive the next save.
    pub fn live_datasets(&self) -> impl Iterator<Item = &Dataset> {
        self.datasets.iter().filter(|d| d.persistence.is_active())
    }

    pub fn is_empty(&self) -> bool {
        self.live_datasets().next().is_none()
    }

    pub fn active_datasets(&self) -> impl Iterator<Item = &Dataset> {
        self.live_datasets()
            .filter(|d| d.status == DatasetStatus::Active)
    }

    pub fn set_managed(&mut self, managed: bool) {
        if self.managed != managed {
            self.managed = managed;
            self.persistence.mark_dirty();
        }
    }

    pub fn to_delete(&mut self) -> Result<()> {
        if self.managed {
            return Err(CatalogError::dependency_still_exists(
                "container",
                &self.uri,
                "container is managed",
            ));
        }
        if !self.is_empty() {
            return Err(CatalogError::dependency_still_exists(
                "container",
                &self.uri,
                "container still holds datasets",
            ));
        }
        self.persistence.mark_to_delete();
        Ok(())
    }

    pub(crate) fn mark_persisted(&mut self) {
        self.datasets.retain(|d| !d.persistence.is_to_delete());
        for dataset in &mut self.datasets {
            if dataset.persistence.needs_save() {
                dataset.persistence.mark_persisted();
            }
        }
        if self.persistence.needs_save() {
            self.persistence.mark_persisted();
        }
    }
}

/// Strips the `_{n}.tif` packing suffix of a consolidated container uri.
pub fn base_name(uri: &str) -> &str {
    let Some(stem) = uri.strip_suffix(".tif") else {
        return uri;
    };
    match stem.rfind('_') {
        Some(pos)
            if pos + 1 < stem.len() && stem[pos + 1..].bytes().all(|b| b.is_ascii_digit()) =>
        {
            &stem[..pos]
        }
        _ => uri,
    }
}

/// Numeric packing suffix of a consolidated container uri, if any.
pub fn packing_suffix(uri: &str) -> Option<u32> {
    let base = base_name(uri);
    if base.len() == uri.len() {
        return None;
    }
    uri[base.len() + 1..uri.len() - ".tif".len()].parse().ok()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::dataset::{DType, DataFormat};
    use crate::models::geometry::BBox;

    fn dataset() -> Dataset {
        Dataset::new(
            Uuid::new_v4(),
            Uuid::new_v4(),
            "",
            "",
            vec![1],
            DataFormat {
                dtype: DType::Float32,
                no_data: -1.0,
                min_value: 0.0,
                max_value: 1.0,
            },
            BBox::new(0.0, 0.0, 1.0, 1.0),
            BBox::new(0.0, 0.0, 1.0, 1.0),
        )
    }

    #[test]
    fn test_base_name() {
        assert_eq!(base_name("s3://b/l/0_0/i_3.tif"), "s3://b/l/0_0/i");
        assert_eq!(packing_suffix("s3://b/l/0_0/i_3.tif"), Some(3));
        assert_eq!(base_name("s3://b/raw.tif"), "s3://b/raw.tif");
        assert_eq!(base_name("s3://b/raw_.tif"), "s3://b/raw_.tif");
        assert_eq!(packing_suffix("s3://b/raw.tif"), None);
    }

    #[test]
    fn test_remove_new_dataset_disappears() {
        let mut c = Container::new("file.tif", false, "");
        let ds = dataset();
        let id = ds.id;
        c.add_dataset(ds);
        c.remove_dataset(id).unwrap();
        assert!(c.datasets.is_empty());
    }

    #[test]
    fn test_managed_container_cannot_be_deleted() {
        let mut c = Container::restore("file.tif".into(), true, String::new(), vec![]);
        assert!(matches!(
            c.to_delete(),
            Err(CatalogError::DependencyStillExists { .. })
        ));
        c.set_managed(false);
        c.to_delete().unwrap();
        assert!(c.persistence.is_to_delete());
    }

    #[test]
    fn test_container_with_datasets_cannot_be_deleted() {
        let mut ds = dataset();
        ds.persistence = PersistenceState::Clean;
        let id = ds.id;
        let mut c = Container::restore("file.tif".into(), false, String::new(), vec![ds]);
        assert!(c.to_delete().is_err());
        c.remove_dataset(id).unwrap();
        c.to_delete().unwrap();
    }
}
