//! Datasets: one raster file (or one subdataset of a container) indexed for
//! a record and a variable instance.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use super::geometry::BBox;
use super::persistence_state::PersistenceState;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DType {
    Int8,
    UInt8,
    Int16,
    UInt16,
    Int32,
    UInt32,
    Float32,
    Float64,
}

/// Pixel encoding of a raster.
///
/// `no_data` is commonly NaN for float rasters. The bounds may be infinite.
/// Equality treats two NaNs as the same value, so an unchanged encoding
/// always compares equal to itself.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DataFormat {
    pub dtype: DType,
    #[serde(with = "non_finite")]
    pub no_data: f64,
    #[serde(with = "non_finite")]
    pub min_value: f64,
    #[serde(with = "non_finite")]
    pub max_value: f64,
}

fn same_value(a: f64, b: f64) -> bool {
    a == b || (a.is_nan() && b.is_nan())
}

impl DataFormat {
    /// Whether rasters in both formats can be stacked without re-encoding.
    pub fn same_encoding(&self, other: &DataFormat) -> bool {
        self.dtype == other.dtype
            && same_value(self.no_data, other.no_data)
            && same_value(self.min_value, other.min_value)
            && same_value(self.max_value, other.max_value)
    }
}

impl PartialEq for DataFormat {
    fn eq(&self, other: &Self) -> bool {
        self.same_encoding(other)
    }
}

/// JSON has no literal for NaN or the infinities: they are written as the
/// strings `"nan"`, `"inf"` and `"-inf"`. Finite values stay numbers.
mod non_finite {
    use serde::de::Error as _;
    use serde::{Deserialize, Deserializer, Serializer};

    #[derive(Deserialize)]
    #[serde(untagged)]
    enum Repr {
        Number(f64),
        Text(String),
    }

    pub fn serialize<S: Serializer>(value: &f64, serializer: S) -> Result<S::Ok, S::Error> {
        if value.is_nan() {
            serializer.serialize_str("nan")
        } else if value.is_infinite() && value.is_sign_positive() {
            serializer.serialize_str("inf")
        } else if value.is_infinite() {
            serializer.serialize_str("-inf")
        } else {
            serializer.serialize_f64(*value)
        }
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<f64, D::Error> {
        match Repr::deserialize(deserializer)? {
            Repr::Number(value) => Ok(value),
            Repr::Text(text) => match text.to_ascii_lowercase().as_str() {
                "nan" => Ok(f64::NAN),
                "inf" | "+inf" | "infinity" => Ok(f64::INFINITY),
                "-inf" | "-infinity" => Ok(f64::NEG_INFINITY),
                _ => Err(D::Error::custom(format!("not a float: {text:?}"))),
            },
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DatasetStatus {
    Active,
    ToDelete,
    /// Indexed but not visible yet (consolidation output before the swap).
    Inactive,
}

impl DatasetStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::ToDelete => "to_delete",
            Self::Inactive => "inactive",
        }
    }
}

impl fmt::Display for DatasetStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl std::str::FromStr for DatasetStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(Self::Active),
            "to_delete" => Ok(Self::ToDelete),
            "inactive" => Ok(Self::Inactive),
            _ => Err(format!("Invalid dataset status: {s}")),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Dataset {
    pub id: Uuid,
    pub record_id: Uuid,
    pub instance_id: Uuid,
    pub container_uri: String,
    /// Subdataset inside the container, empty for a plain file.
    pub container_subdir: String,
    pub bands: Vec<i64>,
    pub dformat: DataFormat,
    pub overviews: bool,
    /// Footprint in the layout CRS.
    pub geometry: BBox,
    /// Valid-data shape in the layout CRS.
    pub shape: BBox,
    pub status: DatasetStatus,
    pub persistence: PersistenceState,
}

impl Dataset {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        record_id: Uuid,
        instance_id: Uuid,
        container_uri: impl Into<String>,
        container_subdir: impl Into<String>,
        bands: Vec<i64>,
        dformat: DataFormat,
        geometry: BBox,
        shape: BBox,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            record_id,
            instance_id,
            container_uri: container_uri.into(),
            container_subdir: container_subdir.into(),
            bands,
            dformat,
            overviews: false,
            geometry,
            shape,
            status: DatasetStatus::Active,
            persistence: PersistenceState::New,
        }
    }

    /// Full GDAL-style name of the dataset.
    pub fn gdal_uri(&self) -> String {
        if self.container_subdir.is_empty() {
            self.container_uri.clone()
        } else {
            format!("{}:{}", self.container_subdir, self.container_uri)
        }
    }

    pub fn set_status(&mut self, status: DatasetStatus) {
        if self.status != status {
            self.status = status;
            self.persistence.mark_dirty();
        }
    }
}
