use serde_json::json;

use super::report::{PetSize, ReportStatus, Species};
use crate::remote::Filter;

/// Normalized filter set identifying one feed cache entry.
///
/// Equality is over the filter fields only; the pagination cursor is
/// deliberately not part of the identity, so pages fetched under the same
/// filters accumulate in one entry.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct ReportFilter {
    pub status: Option<ReportStatus>,
    pub species: Option<Species>,
    pub breed: Option<String>,
    pub color: Option<String>,
    pub size: Option<PetSize>,
}

impl ReportFilter {
    pub fn status(mut self, status: ReportStatus) -> Self {
        self.status = Some(status);
        self
    }

    pub fn species(mut self, species: Species) -> Self {
        self.species = Some(species);
        self
    }

    pub fn breed(mut self, breed: impl Into<String>) -> Self {
        self.breed = Some(breed.into());
        self
    }

    pub fn color(mut self, color: impl Into<String>) -> Self {
        self.color = Some(color.into());
        self
    }

    pub fn size(mut self, size: PetSize) -> Self {
        self.size = Some(size);
        self
    }

    /// Store-level predicates for this filter set.
    pub fn to_store_filters(&self) -> Vec<Filter> {
        let mut filters = Vec::new();
        if let Some(status) = self.status {
            filters.push(Filter::Eq("status", json!(status)));
        }
        if let Some(species) = self.species {
            filters.push(Filter::Eq("species", json!(species)));
        }
        if let Some(breed) = &self.breed {
            filters.push(Filter::Eq("breed", json!(breed)));
        }
        if let Some(color) = &self.color {
            filters.push(Filter::Eq("color", json!(color)));
        }
        if let Some(size) = self.size {
            filters.push(Filter::Eq("size", json!(size)));
        }
        filters
    }
}
