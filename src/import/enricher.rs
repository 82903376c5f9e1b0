//! Hook for externally generated listing text.
//!
//! The importer stores whatever the enricher returns as opaque columns and
//! never interprets it.

use crate::models::CanonicalRecord;

/// Generated SEO text for one listing.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SeoFields {
    pub title: Option<String>,
    pub description: Option<String>,
}

pub trait RecordEnricher: Send + Sync {
    fn enrich(&self, record: &CanonicalRecord) -> SeoFields;
}

/// Leaves the SEO columns empty.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoEnrichment;

impl RecordEnricher for NoEnrichment {
    fn enrich(&self, _record: &CanonicalRecord) -> SeoFields {
        SeoFields::default()
    }
}

impl<F> RecordEnricher for F
where
    F: Fn(&CanonicalRecord) -> SeoFields + Send + Sync,
{
    fn enrich(&self, record: &CanonicalRecord) -> SeoFields {
        self(record)
    }
}
