//! Variables, their instances and consolidation parameters.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use super::dataset::DataFormat;
use super::persistence_state::PersistenceState;
use crate::error::{CatalogError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resampling {
    Near,
    Bilinear,
    Cubic,
    Average,
    Mode,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Compression {
    None,
    Lzw,
    Deflate,
    Zstd,
}

/// How the output containers of a consolidation are encoded.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ConsolidationParams {
    pub dformat: DataFormat,
    pub exponent: f64,
    pub compression: Compression,
    /// Smallest overview size in pixels; negative disables overviews.
    pub overviews_min_size: i32,
    pub resampling_alg: Resampling,
    pub storage_class: String,
    pub bands_interleave: bool,
    #[serde(skip)]
    pub persistence: PersistenceState,
}

impl ConsolidationParams {
    pub fn validate(&self) -> Result<()> {
        if !(self.exponent > 0.0) {
            return Err(CatalogError::validation(
                "consolidation params: exponent must be positive",
            ));
        }
        if self.dformat.min_value > self.dformat.max_value {
            return Err(CatalogError::validation(
                "consolidation params: min_value is greater than max_value",
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct VariableInstance {
    pub id: Uuid,
    pub variable_id: Uuid,
    pub name: String,
    pub metadata: serde_json::Value,
    pub persistence: PersistenceState,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Variable {
    pub id: Uuid,
    pub name: String,
    pub unit: String,
    pub description: String,
    pub bands: Vec<String>,
    pub dformat: DataFormat,
    pub resampling_alg: Resampling,
    pub instances: Vec<VariableInstance>,
    pub consolidation_params: Option<ConsolidationParams>,
    pub persistence: PersistenceState,
}

impl Variable {
    pub fn new(
        name: impl Into<String>,
        unit: impl Into<String>,
        bands: Vec<String>,
        dformat: DataFormat,
        resampling_alg: Resampling,
    ) -> Result<Self> {
        let name = name.into();
        validate_name("variable", &name)?;
        if bands.is_empty() {
            return Err(CatalogError::validation(format!(
                "variable {name}: at least one band is required"
            )));
        }
        Ok(Self {
            id: Uuid::new_v4(),
            name,
            unit: unit.into(),
            description: String::new(),
            bands,
            dformat,
            resampling_alg,
            instances: Vec::new(),
            consolidation_params: None,
            persistence: PersistenceState::New,
        })
    }

    pub fn add_instance(&mut self, name: impl Into<String>) -> Result<Uuid> {
        let name = name.into();
        validate_name("instance", &name)?;
        if self.instance_by_name(&name).is_some() {
            return Err(CatalogError::already_exists("instance", name));
        }
        let id = Uuid::new_v4();
        self.instances.push(VariableInstance {
            id,
            variable_id: self.id,
            name,
            metadata: serde_json::Value::Null,
            persistence: PersistenceState::New,
        });
        Ok(id)
    }

    pub fn instance(&self, id: Uuid) -> Option<&VariableInstance> {
        self.instances
            .iter()
            .find(|i| i.id == id && i.persistence.is_active())
    }

    pub fn instance_by_name(&self, name: &str) -> Option<&VariableInstance> {
        self.instances
            .iter()
            .find(|i| i.name == name && i.persistence.is_active())
    }

    pub fn delete_instance(&mut self, id: Uuid) -> Result<()> {
        let position = self
            .instances
            .iter()
            .position(|i| i.id == id)
            .ok_or_else(|| CatalogError::not_found("instance", id))?;
        if self.instances[position].persistence.is_new() {
            self.instances.remove(position);
        } else {
            self.instances[position].persistence.mark_to_delete();
        }
        Ok(())
    }

    pub fn set_consolidation_params(&mut self, mut params: ConsolidationParams) -> Result<()> {
        params.validate()?;
        params.persistence = match &self.consolidation_params {
            Some(current) if !current.persistence.is_new() => PersistenceState::Dirty,
            _ => PersistenceState::New,
        };
        self.consolidation_params = Some(params);
        Ok(())
    }

    /// Parameters to use when none were set explicitly.
    pub fn default_consolidation_params(&self) -> ConsolidationParams {
        ConsolidationParams {
            dformat: self.dformat,
            exponent: 1.0,
            compression: Compression::Lzw,
            overviews_min_size: 256,
            resampling_alg: self.resampling_alg,
            storage_class: String::from("STANDARD"),
            bands_interleave: false,
            persistence: PersistenceState::New,
        }
    }

    pub(crate) fn mark_persisted(&mut self) {
        self.instances.retain(|i| !i.persistence.is_to_delete());
        for instance in &mut self.instances {
            if instance.persistence.needs_save() {
                instance.persistence.mark_persisted();
            }
        }
        if let Some(params) = &mut self.consolidation_params {
            if params.persistence.needs_save() {
                params.persistence.mark_persisted();
            }
        }
        if self.persistence.needs_save() {
            self.persistence.mark_persisted();
        }
    }
}

pub(crate) fn validate_name(entity: &str, name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 128
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.' | ' '));
    if valid {
        Ok(())
    } else {
        Err(CatalogError::validation(format!(
            "invalid {entity} name: {name:?}"
        )))
    }
}
