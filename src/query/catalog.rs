//! Named, parameterized read operations.
//!
//! Each [`QueryDefinition`] pairs default parameters with a pure builder that
//! turns the merged parameters into a [`StoreOperation`]. Definitions that
//! depend on an optional index also carry a fallback builder.

use serde::Serialize;
use serde_json::{Map, Value, json};

use super::StoreOperation;
use crate::error::{ApiError, ApiResult};
use crate::store::filter::{GeoBox, GeoPoint};
use crate::store::{Capability, FindQuery, PopulateSpec, Projection, SortSpec};

/// Caller-supplied parameters, as received in the request body.
pub type Parameters = Map<String, Value>;

/// Largest `limit` a catalog query accepts.
pub const MAX_CATALOG_LIMIT: u64 = 100;

type Builder = fn(&QueryParams) -> ApiResult<StoreOperation>;

/// Weaker operation used when the primary one needs a missing index.
#[derive(Debug, Clone, Copy)]
pub struct Fallback {
    pub capability: Capability,
    build: Builder,
}

/// One catalog entry.
#[derive(Debug, Clone, Copy)]
pub struct QueryDefinition {
    pub id: &'static str,
    pub title: &'static str,
    pub description: &'static str,
    pub collection: &'static str,
    defaults: fn() -> Value,
    build: Builder,
    fallback: Option<Fallback>,
}

/// Listing view of a definition.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct DefinitionSummary {
    pub id: &'static str,
    pub title: &'static str,
    pub description: &'static str,
    pub collection: &'static str,
    pub default_parameters: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub fallback_from: Option<Capability>,
}

impl QueryDefinition {
    pub fn default_parameters(&self) -> Value {
        (self.defaults)()
    }

    /// Merge `given` over the defaults.
    pub fn parameters(&self, given: &Parameters) -> QueryParams {
        QueryParams::merge(self.default_parameters(), given)
    }

    /// Build the primary operation.
    pub fn build(&self, params: &QueryParams) -> ApiResult<StoreOperation> {
        (self.build)(params)
    }

    /// Build the fallback operation, if this definition has one.
    pub fn build_fallback(&self, params: &QueryParams) -> Option<ApiResult<StoreOperation>> {
        self.fallback.map(|fallback| (fallback.build)(params))
    }

    pub fn fallback_capability(&self) -> Option<Capability> {
        self.fallback.map(|f| f.capability)
    }

    pub fn summary(&self) -> DefinitionSummary {
        DefinitionSummary {
            id: self.id,
            title: self.title,
            description: self.description,
            collection: self.collection,
            default_parameters: self.default_parameters(),
            fallback_from: self.fallback_capability(),
        }
    }
}

/// Parameters after merging over the definition defaults.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryParams {
    values: Parameters,
}

impl QueryParams {
    /// Caller values replace defaults unless they are `null` or an empty string.
    pub fn merge(defaults: Value, given: &Parameters) -> Self {
        let mut values = match defaults {
            Value::Object(map) => map,
            _ => Map::new(),
        };
        for (key, value) in given {
            let absent = value.is_null() || value.as_str().is_some_and(str::is_empty);
            if !absent {
                values.insert(key.clone(), value.clone());
            }
        }
        Self { values }
    }

    pub fn as_map(&self) -> &Parameters {
        &self.values
    }

    fn missing(key: &str) -> ApiError {
        ApiError::validation_with(
            format!("Missing parameter '{key}'"),
            json!({ key: "required" }),
        )
    }

    pub fn string(&self, key: &str) -> ApiResult<String> {
        match self.values.get(key) {
            Some(Value::String(s)) => Ok(s.clone()),
            Some(Value::Number(n)) => Ok(n.to_string()),
            Some(_) => Err(ApiError::validation_with(
                format!("Parameter '{key}' must be a string"),
                json!({ key: "expected a string" }),
            )),
            None => Err(Self::missing(key)),
        }
    }

    /// Numbers are accepted as JSON numbers or numeric strings.
    pub fn number(&self, key: &str) -> ApiResult<f64> {
        let invalid = || {
            ApiError::validation_with(
                format!("Parameter '{key}' must be a number"),
                json!({ key: "expected a number" }),
            )
        };
        match self.values.get(key) {
            Some(Value::Number(n)) => n.as_f64().ok_or_else(invalid),
            Some(Value::String(s)) => s.trim().parse::<f64>().map_err(|_| invalid()),
            Some(_) => Err(invalid()),
            None => Err(Self::missing(key)),
        }
    }

    /// `[longitude, latitude]`.
    pub fn point(&self, key: &str) -> ApiResult<GeoPoint> {
        let value = self.values.get(key).ok_or_else(|| Self::missing(key))?;
        GeoPoint::from_value(value).ok_or_else(|| {
            ApiError::validation_with(
                format!("Parameter '{key}' must be [longitude, latitude]"),
                json!({ key: "expected [longitude, latitude]" }),
            )
        })
    }

    /// `limit` clamped to `[1, MAX_CATALOG_LIMIT]`. Non-positive or
    /// non-numeric values fall back to `default`.
    pub fn limit(&self, default: u64) -> u64 {
        let requested = self.values.get("limit").and_then(|v| match v {
            Value::Number(n) => n.as_f64(),
            Value::String(s) => s.trim().parse::<f64>().ok(),
            _ => None,
        });
        match requested {
            Some(n) if n >= 1.0 => (n as u64).min(MAX_CATALOG_LIMIT),
            _ => default.clamp(1, MAX_CATALOG_LIMIT),
        }
    }
}

/// Static registry of catalog queries.
#[derive(Debug, Clone)]
pub struct QueryCatalog {
    definitions: Vec<QueryDefinition>,
}

impl Default for QueryCatalog {
    fn default() -> Self {
        Self::standard()
    }
}

impl QueryCatalog {
    pub fn new(definitions: Vec<QueryDefinition>) -> Self {
        Self { definitions }
    }

    pub fn standard() -> Self {
        Self::new(vec![
            BASIC_FIND_COMPANIES,
            ADVANCED_JOB_SEARCH,
            SALARY_ANALYSIS,
            TEXT_SEARCH_JOBS,
            NEARBY_JOBS,
            USER_PROFILES,
            COMPANY_ANALYTICS,
            APPLICATION_TRENDS,
            JOB_SEEKER_SKILLS,
            EMPLOYER_HIRING_STATS,
        ])
    }

    pub fn get(&self, id: &str) -> Option<&QueryDefinition> {
        self.definitions.iter().find(|d| d.id == id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &QueryDefinition> {
        self.definitions.iter()
    }

    pub fn len(&self) -> usize {
        self.definitions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.definitions.is_empty()
    }
}

fn company_name_only() -> PopulateSpec {
    PopulateSpec {
        path: "companyId".to_string(),
        from: "companies".to_string(),
        select: Some(Projection::include(["companyName"])),
    }
}

const TEXT_SEARCH_FIELDS: [&str; 5] = [
    "title",
    "description",
    "companyId",
    "shortDescription",
    "requiredSkills",
];

const BASIC_FIND_COMPANIES: QueryDefinition = QueryDefinition {
    id: "basic-find-companies",
    title: "Find companies by industry",
    description: "Active companies in one industry with a few headline fields.",
    collection: "companies",
    defaults: || json!({"industry": "Technology", "limit": 5}),
    build: |p| {
        Ok(StoreOperation::Find(
            FindQuery::new(json!({"industry": p.string("industry")?, "isActive": true}))
                .select(Projection::include([
                    "companyName",
                    "industry",
                    "employeeCount",
                    "averageRating",
                ]))
                .limit(p.limit(5)),
        ))
    },
    fallback: None,
};

const ADVANCED_JOB_SEARCH: QueryDefinition = QueryDefinition {
    id: "advanced-job-search",
    title: "Advanced job search",
    description: "Active remote-friendly jobs in a city above a minimum salary, newest first.",
    collection: "jobs",
    defaults: || json!({"city": "Doha", "minSalary": 15000, "currency": "QAR", "limit": 5}),
    build: |p| {
        let filter = json!({
            "status": "Active",
            "locations.city": p.string("city")?,
            "$or": [
                {"workArrangement": "Remote"},
                {"locations.isRemoteAllowed": true}
            ],
            "salaryRange.min": {"$gte": p.number("minSalary")?},
            "salaryRange.currency": p.string("currency")?
        });
        Ok(StoreOperation::Find(
            FindQuery::new(filter)
                .populate(PopulateSpec {
                    path: "companyId".to_string(),
                    from: "companies".to_string(),
                    select: Some(Projection::include(["companyName", "logoUrl"])),
                })
                .sort(SortSpec::new().desc("postedDate").desc("salaryRange.max"))
                .limit(p.limit(5)),
        ))
    },
    fallback: None,
};

const SALARY_ANALYSIS: QueryDefinition = QueryDefinition {
    id: "salary-analysis",
    title: "Salary analysis",
    description: "Average salary bands of active jobs by experience level and industry.",
    collection: "jobs",
    defaults: || json!({"currency": "QAR", "limit": 20}),
    build: |p| {
        Ok(StoreOperation::Aggregate(vec![
            json!({"$match": {"status": "Active", "salaryRange.currency": p.string("currency")?}}),
            json!({"$lookup": {"from": "companies", "localField": "companyId", "foreignField": "_id", "as": "company"}}),
            json!({"$unwind": "$company"}),
            json!({"$group": {
                "_id": {"experienceLevel": "$experienceLevel", "industry": "$company.industry"},
                "avgMinSalary": {"$avg": "$salaryRange.min"},
                "avgMaxSalary": {"$avg": "$salaryRange.max"},
                "jobCount": {"$sum": 1}
            }}),
            json!({"$sort": {"_id.industry": 1, "_id.experienceLevel": 1}}),
            json!({"$limit": p.limit(20)}),
        ]))
    },
    fallback: None,
};

const TEXT_SEARCH_JOBS: QueryDefinition = QueryDefinition {
    id: "text-search-jobs",
    title: "Text search over jobs",
    description: "Relevance-ranked keyword search over active jobs.",
    collection: "jobs",
    defaults: || json!({"keywords": "software developer", "limit": 5}),
    build: |p| {
        Ok(StoreOperation::Find(
            FindQuery::new(json!({
                "$text": {"$search": p.string("keywords")?},
                "status": "Active"
            }))
            .select(Projection::include(TEXT_SEARCH_FIELDS))
            .populate(company_name_only())
            .sort(SortSpec::new().text_score("score"))
            .limit(p.limit(5)),
        ))
    },
    fallback: Some(Fallback {
        capability: Capability::TextSearch,
        build: |p| {
            let pattern = keyword_pattern(&p.string("keywords")?);
            let regex = json!({"$regex": pattern, "$options": "i"});
            Ok(StoreOperation::Find(
                FindQuery::new(json!({
                    "$or": [
                        {"title": regex},
                        {"description": regex},
                        {"shortDescription": regex},
                        {"requiredSkills": regex}
                    ],
                    "status": "Active"
                }))
                .select(Projection::include(TEXT_SEARCH_FIELDS))
                .populate(company_name_only())
                .limit(p.limit(5)),
            ))
        },
    }),
};

/// Case-insensitive alternation of the escaped keywords.
pub fn keyword_pattern(keywords: &str) -> String {
    let words: Vec<String> = keywords.split_whitespace().map(regex::escape).collect();
    if words.is_empty() {
        return regex::escape(keywords);
    }
    words.join("|")
}

const NEARBY_JOBS: QueryDefinition = QueryDefinition {
    id: "nearby-jobs",
    title: "Jobs near a location",
    description: "Active jobs within a radius of a point, nearest first.",
    collection: "jobs",
    defaults: || json!({"coordinates": [51.5310, 25.2854], "maxDistance": 10000, "limit": 5}),
    build: |p| {
        let point = p.point("coordinates")?;
        Ok(StoreOperation::Find(
            FindQuery::new(json!({
                "locations.coordinates": {"$near": {
                    "$geometry": {"type": "Point", "coordinates": [point.lng, point.lat]},
                    "$maxDistance": p.number("maxDistance")?
                }},
                "status": "Active"
            }))
            .populate(company_name_only())
            .limit(p.limit(5)),
        ))
    },
    fallback: Some(Fallback {
        capability: Capability::Geospatial,
        build: |p| {
            let area = GeoBox::around(p.point("coordinates")?, p.number("maxDistance")?);
            Ok(StoreOperation::Find(
                FindQuery::new(json!({
                    "locations.coordinates": {"$geoWithin": {"$box": area.to_value()}},
                    "status": "Active"
                }))
                .populate(company_name_only())
                .limit(p.limit(5)),
            ))
        },
    }),
};

const USER_PROFILES: QueryDefinition = QueryDefinition {
    id: "user-profiles",
    title: "User profiles by role",
    description: "Active users of one role, most recently active first.",
    collection: "users",
    defaults: || json!({"role": "JobSeeker", "limit": 10}),
    build: |p| {
        Ok(StoreOperation::Find(
            FindQuery::new(json!({"role": p.string("role")?, "accountStatus": "Active"}))
                .select(Projection::include([
                    "firstName",
                    "lastName",
                    "email",
                    "role",
                    "profileCompleteness",
                    "lastLoginAt",
                ]))
                .sort(SortSpec::new().desc("lastLoginAt"))
                .limit(p.limit(10)),
        ))
    },
    fallback: None,
};

const COMPANY_ANALYTICS: QueryDefinition = QueryDefinition {
    id: "company-analytics",
    title: "Company analytics",
    description: "Active companies grouped by industry with size and rating averages.",
    collection: "companies",
    defaults: || json!({"limit": 10}),
    build: |p| {
        Ok(StoreOperation::Aggregate(vec![
            json!({"$match": {"isActive": true}}),
            json!({"$group": {
                "_id": "$industry",
                "companyCount": {"$sum": 1},
                "avgEmployeeCount": {"$avg": "$employeeCount"},
                "avgRating": {"$avg": "$averageRating"}
            }}),
            json!({"$sort": {"companyCount": -1}}),
            json!({"$limit": p.limit(10)}),
        ]))
    },
    fallback: None,
};

const APPLICATION_TRENDS: QueryDefinition = QueryDefinition {
    id: "application-trends",
    title: "Application trends",
    description: "Applications per status and month, most recent first.",
    collection: "applications",
    defaults: || json!({"limit": 20}),
    build: |p| {
        Ok(StoreOperation::Aggregate(vec![
            json!({"$group": {
                "_id": {
                    "status": "$status",
                    "month": {"$month": "$appliedAt"},
                    "year": {"$year": "$appliedAt"}
                },
                "count": {"$sum": 1}
            }}),
            json!({"$sort": {"_id.year": -1, "_id.month": -1}}),
            json!({"$limit": p.limit(20)}),
        ]))
    },
    fallback: None,
};

const JOB_SEEKER_SKILLS: QueryDefinition = QueryDefinition {
    id: "job-seeker-skills",
    title: "Job seeker skills",
    description: "Most common job seeker skills with average proficiency.",
    collection: "jobseekerprofiles",
    defaults: || json!({"limit": 15}),
    build: |p| {
        Ok(StoreOperation::Aggregate(vec![
            json!({"$unwind": "$skills"}),
            json!({"$group": {
                "_id": "$skills.name",
                "count": {"$sum": 1},
                "avgProficiency": {"$avg": "$skills.proficiencyLevel"}
            }}),
            json!({"$sort": {"count": -1}}),
            json!({"$limit": p.limit(15)}),
        ]))
    },
    fallback: None,
};

const EMPLOYER_HIRING_STATS: QueryDefinition = QueryDefinition {
    id: "employer-hiring-stats",
    title: "Employer hiring statistics",
    description: "Employers with the number of jobs they posted and how many are active.",
    collection: "employerprofiles",
    defaults: || json!({"limit": 10}),
    build: |p| {
        Ok(StoreOperation::Aggregate(vec![
            json!({"$lookup": {"from": "jobs", "localField": "userId", "foreignField": "postedBy", "as": "postedJobs"}}),
            json!({"$project": {
                "firstName": 1,
                "lastName": 1,
                "department": 1,
                "hiringAuthority": 1,
                "totalJobsPosted": {"$size": "$postedJobs"},
                "activeJobs": {"$size": {"$filter": {
                    "input": "$postedJobs",
                    "cond": {"$eq": ["$$this.status", "Active"]}
                }}}
            }}),
            json!({"$sort": {"totalJobsPosted": -1}}),
            json!({"$limit": p.limit(10)}),
        ]))
    },
    fallback: None,
};

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    fn params(value: Value) -> Parameters {
        value.as_object().cloned().unwrap()
    }

    #[test]
    fn test_catalog_ids_are_unique() {
        let catalog = QueryCatalog::standard();
        let mut ids: Vec<&str> = catalog.iter().map(|d| d.id).collect();
        ids.sort_unstable();
        ids.dedup();
        assert_eq!(ids.len(), catalog.len());
        assert!(catalog.get("nope").is_none());
    }

    #[test]
    fn test_every_definition_builds_with_defaults() {
        for definition in QueryCatalog::standard().iter() {
            let p = definition.parameters(&Parameters::new());
            assert!(definition.build(&p).is_ok(), "{} failed to build", definition.id);
            if let Some(fallback) = definition.build_fallback(&p) {
                assert!(fallback.is_ok(), "{} fallback failed to build", definition.id);
            }
        }
    }

    #[test]
    fn test_parameters_merge_over_defaults() {
        let p = BASIC_FIND_COMPANIES.parameters(&params(json!({"industry": "Finance", "limit": null})));
        assert_eq!(p.string("industry").unwrap(), "Finance");
        assert_eq!(p.limit(5), 5);

        let p = BASIC_FIND_COMPANIES.parameters(&params(json!({"industry": ""})));
        assert_eq!(p.string("industry").unwrap(), "Technology");
    }

    #[test]
    fn test_limit_is_clamped() {
        let p = QueryParams::merge(json!({}), &params(json!({"limit": 10000})));
        assert_eq!(p.limit(5), MAX_CATALOG_LIMIT);
        let p = QueryParams::merge(json!({}), &params(json!({"limit": 0})));
        assert_eq!(p.limit(5), 5);
        let p = QueryParams::merge(json!({}), &params(json!({"limit": "7"})));
        assert_eq!(p.limit(5), 7);
    }

    #[test]
    fn test_bad_parameter_types_are_validation_errors() {
        let p = NEARBY_JOBS.parameters(&params(json!({"coordinates": "here"})));
        let err = NEARBY_JOBS.build(&p).unwrap_err();
        assert_eq!(err.status(), axum::http::StatusCode::BAD_REQUEST);

        let p = ADVANCED_JOB_SEARCH.parameters(&params(json!({"minSalary": "lots"})));
        assert!(ADVANCED_JOB_SEARCH.build(&p).is_err());
    }

    #[test]
    fn test_keyword_pattern_escapes() {
        assert_eq!(keyword_pattern("software developer"), "software|developer");
        assert_eq!(keyword_pattern("c++ dev"), r"c\+\+|dev");
    }

    #[test]
    fn test_fallbacks_declared_for_index_backed_queries() {
        let catalog = QueryCatalog::standard();
        assert_eq!(
            catalog.get("text-search-jobs").unwrap().fallback_capability(),
            Some(Capability::TextSearch)
        );
        assert_eq!(
            catalog.get("nearby-jobs").unwrap().fallback_capability(),
            Some(Capability::Geospatial)
        );
        assert_eq!(catalog.get("user-profiles").unwrap().fallback_capability(), None);
    }
}
