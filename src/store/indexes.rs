//! Index definitions for the optional text and geospatial capabilities.
//!
//! Only indexes that change what a query *can* do are modelled. Plain
//! single-field indexes only change speed and have no meaning for the
//! in-memory store.

use serde::Serialize;

use super::Capability;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum IndexKind {
    Text { fields: Vec<String> },
    #[serde(rename = "2dsphere")]
    Geo2dSphere { field: String },
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct IndexSpec {
    pub collection: String,
    pub name: String,
    #[serde(flatten)]
    pub kind: IndexKind,
}

impl IndexSpec {
    pub fn text<I, S>(collection: &str, fields: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            collection: collection.to_string(),
            name: format!("{collection}_text"),
            kind: IndexKind::Text {
                fields: fields.into_iter().map(Into::into).collect(),
            },
        }
    }

    pub fn geo(collection: &str, field: &str) -> Self {
        Self {
            collection: collection.to_string(),
            name: format!("{field}_2dsphere"),
            kind: IndexKind::Geo2dSphere {
                field: field.to_string(),
            },
        }
    }

    pub fn capability(&self) -> Capability {
        match self.kind {
            IndexKind::Text { .. } => Capability::TextSearch,
            IndexKind::Geo2dSphere { .. } => Capability::Geospatial,
        }
    }
}

/// Text and 2dsphere indexes the service expects on a fully provisioned store.
pub fn standard_indexes() -> Vec<IndexSpec> {
    vec![
        IndexSpec::text(
            "jobs",
            [
                "title",
                "description",
                "shortDescription",
                "requiredSkills",
                "preferredSkills",
                "tags",
                "keywords",
            ],
        ),
        IndexSpec::geo("jobs", "locations.coordinates"),
        IndexSpec::text(
            "companies",
            ["companyName", "description", "companyValues", "mission", "vision"],
        ),
        IndexSpec::geo("companies", "locations.coordinates"),
        IndexSpec::text(
            "employerprofiles",
            [
                "jobTitle",
                "bio",
                "hiringPreferences.requiredSkills",
                "hiringPreferences.preferredSkills",
                "specializations",
            ],
        ),
    ]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_indexes_cover_job_capabilities() {
        let indexes = standard_indexes();
        let jobs: Vec<Capability> = indexes
            .iter()
            .filter(|i| i.collection == "jobs")
            .map(IndexSpec::capability)
            .collect();
        assert!(jobs.contains(&Capability::TextSearch));
        assert!(jobs.contains(&Capability::Geospatial));
    }

    #[test]
    fn test_index_names() {
        assert_eq!(IndexSpec::geo("jobs", "locations.coordinates").name, "locations.coordinates_2dsphere");
        assert_eq!(IndexSpec::text("jobs", ["title"]).name, "jobs_text");
    }
}
