//! Fluent query specification for the catalog service.
//!
//! A [`Query`] is a plain value: every mutator consumes and returns `self`,
//! and branching task generation works on clones, so two branches can never
//! share filter state. Resolving produces the wire URI, including the
//! ElasticSearch-style `_query` payload.

use chrono::NaiveDate;
use serde_json::{json, Map, Value};
use url::Url;

use crate::error::DumpError;

pub const DEFAULT_PAGE: u32 = 1;
pub const DEFAULT_SIZE: u32 = 10;

const UPDATE_DATE: &str = "metadata.tdms__update_date";
const DELETED: &str = "metadata.tdms__deleted";
const PUBLISHED: &str = "publishing_channels.tdms__published";
const CHANNEL_PATH: &str = "publishing_channels";
const CHANNEL_CODE: &str = "publishing_channels.tdms__publishing_channel.@code";
const TOURISTIC_TYPE: &str = "metadata.tdms__touristic_product_type.@code";
const OWNER_EMAIL: &str = "claims.claim.owner.email_address";
const PARTNER_ID: &str = "partner_id";
const PRODUCT_ID: &str = "metadata.tdms__id";
const MUNICIPALITY: &str = "location.tdms__municipality";
const VOCABULARY_NAME: &str = "machine_name";
const STATS_YEAR: &str = "year";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Format {
    Xml,
    Json,
    JsonHal,
}

impl Format {
    pub fn wire_name(self) -> &'static str {
        match self {
            Format::Xml => "xml",
            Format::Json => "json",
            Format::JsonHal => "json+hal",
        }
    }

    pub fn extension(self) -> &'static str {
        match self {
            Format::Xml => "xml",
            Format::Json | Format::JsonHal => "json",
        }
    }

    pub fn mime_type(self) -> &'static str {
        match self {
            Format::Xml => "application/xml",
            Format::Json => "application/json",
            Format::JsonHal => "application/hal+json",
        }
    }
}

impl std::fmt::Display for Format {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.wire_name())
    }
}

/// The resource families the service exposes. Each seeds its own base
/// resource selector at construction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResourceKind {
    Product,
    Vocabulary,
    Claim,
    Statistics,
}

impl ResourceKind {
    fn label(self) -> &'static str {
        match self {
            ResourceKind::Product => "product",
            ResourceKind::Vocabulary => "vocabulary",
            ResourceKind::Claim => "claim",
            ResourceKind::Statistics => "statistics",
        }
    }
}

/// Token injected into a resolved URI. `Masked` is for logs and reports.
#[derive(Debug, Clone, Copy)]
pub enum TokenRef<'a> {
    Bearer(&'a str),
    Masked,
}

/// Last-modified window; either bound may be open. The lower bound is
/// inclusive, the upper bound exclusive.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DateRange {
    pub gte: Option<NaiveDate>,
    pub lt: Option<NaiveDate>,
}

#[derive(Debug, Clone)]
pub struct Query {
    kind: ResourceKind,
    format: Format,
    bulk: bool,
    page: u32,
    size: u32,
    resources: Vec<String>,
    touristic_types: Vec<String>,
    channels: Vec<String>,
    lastmod: Option<DateRange>,
    soft_deleted: Option<bool>,
    published: Option<bool>,
    select_id: Option<String>,
    municipality: Option<String>,
    owner_email: Option<String>,
    partner_id: Option<String>,
    required_fields: Vec<String>,
    key_value_filters: Vec<(String, String)>,
    vocabulary_name: Option<String>,
    stats_year: Option<i32>,
    free_text: Option<String>,
}

impl Query {
    fn with_kind(kind: ResourceKind, resources: Vec<String>) -> Self {
        Self {
            kind,
            format: Format::Xml,
            bulk: false,
            page: DEFAULT_PAGE,
            size: DEFAULT_SIZE,
            resources,
            touristic_types: Vec::new(),
            channels: Vec::new(),
            lastmod: None,
            soft_deleted: None,
            published: None,
            select_id: None,
            municipality: None,
            owner_email: None,
            partner_id: None,
            required_fields: Vec::new(),
            key_value_filters: Vec::new(),
            vocabulary_name: None,
            stats_year: None,
            free_text: None,
        }
    }

    pub fn product() -> Self {
        Self::with_kind(ResourceKind::Product, vec!["accommodation".to_string()])
    }

    pub fn vocabulary() -> Self {
        Self::with_kind(ResourceKind::Vocabulary, vec!["vocabulary".to_string()])
    }

    pub fn claims() -> Self {
        Self::with_kind(ResourceKind::Claim, vec!["product_claim".to_string()])
    }

    pub fn stats_of_year(year: i32) -> Self {
        Self::with_kind(
            ResourceKind::Statistics,
            vec![format!("bi/product_statistical_data/{year}")],
        )
    }

    pub fn kind(&self) -> ResourceKind {
        self.kind
    }

    pub fn format(&self) -> Format {
        self.format
    }

    // paging

    pub fn page(mut self, page: u32) -> Self {
        self.page = page;
        self
    }

    pub fn size(mut self, size: u32) -> Self {
        self.size = size;
        self
    }

    // output mode

    pub fn as_xml(mut self) -> Self {
        self.format = Format::Xml;
        self
    }

    pub fn as_json(mut self) -> Self {
        self.format = Format::Json;
        self
    }

    pub fn as_json_hal(mut self) -> Self {
        self.format = Format::JsonHal;
        self
    }

    pub fn as_format(self, format: Format) -> Self {
        match format {
            Format::Xml => self.as_xml(),
            Format::Json => self.as_json(),
            Format::JsonHal => self.as_json_hal(),
        }
    }

    /// Request the entire matching result set in one response. Paging
    /// parameters are omitted from bulk URIs.
    pub fn bulk(mut self) -> Self {
        self.bulk = true;
        self
    }

    // resource selection

    pub fn for_resources<I, S>(mut self, resources: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.resources = resources.into_iter().map(Into::into).collect();
        self
    }

    pub fn and_resource(mut self, resource: impl Into<String>) -> Self {
        self.resources.push(resource.into());
        self
    }

    // touristic-type filter

    pub fn for_touristic_types<I, S>(mut self, types: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.touristic_types = types.into_iter().map(Into::into).collect();
        self
    }

    pub fn and_touristic_type(mut self, touristic_type: impl Into<String>) -> Self {
        self.touristic_types.push(touristic_type.into());
        self
    }

    // publishing-channel filter

    pub fn for_channels<I, S>(mut self, channels: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.channels = channels.into_iter().map(Into::into).collect();
        self
    }

    pub fn and_channel(mut self, channel: impl Into<String>) -> Self {
        self.channels.push(channel.into());
        self
    }

    // last-modified filter

    pub fn modified_between(mut self, from: Option<NaiveDate>, to: Option<NaiveDate>) -> Self {
        self.lastmod = match (from, to) {
            (None, None) => None,
            (gte, lt) => Some(DateRange { gte, lt }),
        };
        self
    }

    // soft-delete filter

    pub fn removed(mut self) -> Self {
        self.soft_deleted = Some(true);
        self
    }

    pub fn active(mut self) -> Self {
        self.soft_deleted = Some(false);
        self
    }

    pub fn ignore_removed(mut self) -> Self {
        self.soft_deleted = None;
        self
    }

    // published filter

    pub fn published(mut self) -> Self {
        self.published = Some(true);
        self
    }

    pub fn hidden(mut self) -> Self {
        self.published = Some(false);
        self
    }

    pub fn ignore_published(mut self) -> Self {
        self.published = None;
        self
    }

    // selections

    pub fn with_id(mut self, id: impl Into<String>) -> Self {
        self.select_id = Some(id.into());
        self
    }

    pub fn in_municipality(mut self, name: impl Into<String>) -> Self {
        self.municipality = Some(name.into());
        self
    }

    // claim filters

    pub fn owner(mut self, email: impl Into<String>) -> Self {
        self.owner_email = Some(email.into());
        self
    }

    pub fn partner(mut self, id: impl Into<String>) -> Self {
        self.partner_id = Some(id.into());
        self
    }

    // generic filters

    pub fn require_field(mut self, field: impl Into<String>) -> Self {
        self.required_fields.push(field.into());
        self
    }

    pub fn filter(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.key_value_filters.push((key.into(), value.into()));
        self
    }

    pub fn matching(mut self, term: impl Into<String>) -> Self {
        self.free_text = Some(term.into());
        self
    }

    // vocabulary / statistics filters

    pub fn named(mut self, machine_name: impl Into<String>) -> Self {
        self.vocabulary_name = Some(machine_name.into());
        self
    }

    pub fn of_year(mut self, year: i32) -> Self {
        self.stats_year = Some(year);
        self
    }

    /// Resolve the wire URI against the service base.
    ///
    /// Fails with `InvalidQuery` when no resources are selected. Token
    /// validity is the caller's concern; pass [`TokenRef::Masked`] for a
    /// loggable URI.
    pub fn uri(&self, base: &str, token: TokenRef<'_>) -> Result<String, DumpError> {
        if self.resources.is_empty() {
            return Err(DumpError::InvalidQuery(
                "no resources selected for fetch".to_string(),
            ));
        }

        let prefix = if self.bulk { "bulk/" } else { "" };
        let mut url = Url::parse(base)?.join(&format!("{prefix}{}", self.resources.join(",")))?;

        {
            let mut pairs = url.query_pairs_mut();
            pairs.append_pair("format", self.format.wire_name());
            match token {
                TokenRef::Bearer(t) => pairs.append_pair("access_token", t),
                TokenRef::Masked => pairs.append_pair("access_token", "***"),
            };

            // paging is meaningless in bulk mode
            if !self.bulk {
                if self.size != DEFAULT_SIZE {
                    pairs.append_pair("size", &self.size.to_string());
                }
                if self.page != DEFAULT_PAGE {
                    pairs.append_pair("page", &self.page.to_string());
                }
            }

            if let Some(payload) = self.filter_payload() {
                pairs.append_pair("_query", &payload.to_string());
            }
        }

        Ok(url.into())
    }

    /// The `_query` payload, or `None` when no filter is set.
    ///
    /// Clause order is fixed; an unset field emits nothing (absence, not
    /// "match nothing").
    pub fn filter_payload(&self) -> Option<Value> {
        let mut queries: Vec<Value> = Vec::new();

        if let Some(range) = &self.lastmod {
            let mut bounds = Map::new();
            if let Some(gte) = range.gte {
                bounds.insert("gte".to_string(), json!(format_date(gte)));
            }
            if let Some(lt) = range.lt {
                bounds.insert("lt".to_string(), json!(format_date(lt)));
            }
            queries.push(json!({ "range": { UPDATE_DATE: bounds } }));
        }
        if let Some(deleted) = self.soft_deleted {
            queries.push(json!({ "match": { DELETED: deleted } }));
        }
        if let Some(published) = self.published {
            queries.push(json!({ "match": { PUBLISHED: published } }));
        }
        if let Some(id) = &self.select_id {
            queries.push(json!({ "match": { PRODUCT_ID: id } }));
        }
        if let Some(municipality) = &self.municipality {
            queries.push(json!({ "match": { MUNICIPALITY: municipality } }));
        }
        for (key, value) in &self.key_value_filters {
            queries.push(json!({ "match": { key.as_str(): value } }));
        }
        if let Some(term) = &self.free_text {
            queries.push(json!({ "match": { "_all": { "query": term, "fuzziness": "AUTO" } } }));
        }
        if !self.channels.is_empty() {
            // one nested clause so code and published-flag must match on the
            // same channel instance; pattern composition is uniform, a
            // single-entry list is not unwrapped
            queries.push(json!({
                "nested": {
                    "path": CHANNEL_PATH,
                    "query": { "bool": { "must": [
                        { "regexp": { CHANNEL_CODE: self.channels.join("|") } },
                        { "match": { PUBLISHED: true } },
                    ] } },
                }
            }));
        }
        if !self.touristic_types.is_empty() {
            queries.push(json!({ "terms": { TOURISTIC_TYPE: &self.touristic_types } }));
        }
        if let Some(email) = &self.owner_email {
            queries.push(json!({ "regexp": { OWNER_EMAIL: email } }));
        }
        if let Some(partner) = &self.partner_id {
            queries.push(json!({ "match": { PARTNER_ID: partner } }));
        }
        if let Some(name) = &self.vocabulary_name {
            queries.push(json!({ "match": { VOCABULARY_NAME: name } }));
        }
        if let Some(year) = self.stats_year {
            queries.push(json!({ "match": { STATS_YEAR: year } }));
        }

        let filters: Vec<Value> = self
            .required_fields
            .iter()
            .map(|field| json!({ "exists": { "field": field } }))
            .collect();

        if queries.is_empty() && filters.is_empty() {
            return None;
        }

        let mut filtered = Map::new();
        if !queries.is_empty() {
            filtered.insert("query".to_string(), json!({ "bool": { "must": queries } }));
        }
        if !filters.is_empty() {
            filtered.insert("filter".to_string(), json!({ "bool": { "must": filters } }));
        }
        Some(json!({ "query": { "filtered": filtered } }))
    }

    /// Compact one-line rendering of the set filters, for the run report.
    pub fn filter_summary(&self) -> String {
        let mut parts = vec![format!("{}:{}", self.kind.label(), self.resources.join(","))];
        if let Some(range) = &self.lastmod {
            parts.push(format!(
                "lastmod=[{}..{})",
                range.gte.map_or("*".to_string(), format_date),
                range.lt.map_or("*".to_string(), format_date),
            ));
        }
        if let Some(deleted) = self.soft_deleted {
            parts.push(format!("deleted={deleted}"));
        }
        if let Some(published) = self.published {
            parts.push(format!("published={published}"));
        }
        if let Some(id) = &self.select_id {
            parts.push(format!("id={id}"));
        }
        if let Some(municipality) = &self.municipality {
            parts.push(format!("municipality={municipality}"));
        }
        for (key, value) in &self.key_value_filters {
            parts.push(format!("{key}={value}"));
        }
        if let Some(term) = &self.free_text {
            parts.push(format!("text={term}"));
        }
        if !self.channels.is_empty() {
            parts.push(format!("channels={}", self.channels.join("|")));
        }
        if !self.touristic_types.is_empty() {
            parts.push(format!("types={}", self.touristic_types.join("|")));
        }
        if let Some(email) = &self.owner_email {
            parts.push(format!("owner={email}"));
        }
        if let Some(partner) = &self.partner_id {
            parts.push(format!("partner={partner}"));
        }
        if let Some(name) = &self.vocabulary_name {
            parts.push(format!("vocabulary={name}"));
        }
        if let Some(year) = self.stats_year {
            parts.push(format!("year={year}"));
        }
        if !self.required_fields.is_empty() {
            parts.push(format!("exists={}", self.required_fields.join("|")));
        }
        parts.join(" ")
    }
}

fn format_date(date: NaiveDate) -> String {
    date.format("%Y-%m-%d").to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    const BASE: &str = "http://api.test.local/api/v1/";

    fn date(s: &str) -> NaiveDate {
        s.parse().unwrap()
    }

    fn resolve(query: &Query) -> String {
        query.uri(BASE, TokenRef::Bearer("tok-123")).unwrap()
    }

    fn payload_of(uri: &str) -> Value {
        let url = Url::parse(uri).unwrap();
        let (_, raw) = url
            .query_pairs()
            .find(|(key, _)| key == "_query")
            .expect("no _query parameter");
        serde_json::from_str(&raw).unwrap()
    }

    fn must_clauses(payload: &Value) -> &Vec<Value> {
        payload["query"]["filtered"]["query"]["bool"]["must"]
            .as_array()
            .expect("no query clause list")
    }

    #[test]
    fn defaults_omit_paging_and_filters() {
        let uri = resolve(&Query::product());
        assert_eq!(
            uri,
            "http://api.test.local/api/v1/accommodation?format=xml&access_token=tok-123"
        );
    }

    #[test]
    fn non_default_paging_is_appended() {
        let uri = resolve(&Query::product().size(50).page(3));
        assert!(uri.contains("size=50"));
        assert!(uri.contains("page=3"));
    }

    #[test]
    fn bulk_uris_omit_paging() {
        let uri = resolve(&Query::product().size(50).page(3).bulk());
        assert!(uri.contains("/bulk/accommodation?"));
        assert!(!uri.contains("size="));
        assert!(!uri.contains("page="));
    }

    #[test]
    fn empty_resources_is_an_invalid_query() {
        let query = Query::product().for_resources(Vec::<String>::new());
        match query.uri(BASE, TokenRef::Masked) {
            Err(DumpError::InvalidQuery(_)) => {}
            other => panic!("expected InvalidQuery, got {other:?}"),
        }
    }

    #[test]
    fn resources_are_comma_joined() {
        let uri = resolve(&Query::product().for_resources(["accommodation", "reca"]));
        assert!(uri.contains("/api/v1/accommodation,reca?"));
    }

    #[test]
    fn kind_constructors_seed_resources() {
        assert!(resolve(&Query::vocabulary()).contains("/api/v1/vocabulary?"));
        assert!(resolve(&Query::claims()).contains("/api/v1/product_claim?"));
        assert!(resolve(&Query::stats_of_year(2024))
            .contains("/api/v1/bi/product_statistical_data/2024?"));
    }

    #[test]
    fn masked_token_resolves_without_credentials() {
        let uri = Query::product().uri(BASE, TokenRef::Masked).unwrap();
        assert!(uri.contains("access_token=***"));
    }

    #[test]
    fn resolving_twice_is_identical() {
        let query = Query::product()
            .published()
            .for_channels(["coast*"])
            .modified_between(Some(date("2024-01-01")), Some(date("2024-01-08")))
            .require_field("metadata.tdms__owner")
            .filter("metadata.tdms__partner", "acme");
        assert_eq!(resolve(&query), resolve(&query));
    }

    #[test]
    fn clones_are_value_independent() {
        let base = Query::product().for_channels(["coast*"]);
        let before = resolve(&base);
        let branched = base
            .clone()
            .and_channel("inland*")
            .and_touristic_type("camping")
            .and_resource("reca");
        // the branch diverged; the original's arrays are untouched
        assert_ne!(resolve(&branched), before);
        assert_eq!(resolve(&base), before);
    }

    #[test]
    fn scenario_published_channel_lastmod() {
        let query = Query::product()
            .published()
            .for_channels(["coast*"])
            .modified_between(Some(date("2024-01-01")), Some(date("2024-01-08")));
        let payload = payload_of(&resolve(&query));
        let must = must_clauses(&payload);
        assert_eq!(must.len(), 3);

        let range = &must[0]["range"][UPDATE_DATE];
        assert_eq!(range["gte"], "2024-01-01");
        assert_eq!(range["lt"], "2024-01-08");

        assert_eq!(must[1]["match"][PUBLISHED], true);

        let nested = &must[2]["nested"];
        assert_eq!(nested["path"], CHANNEL_PATH);
        let inner = nested["query"]["bool"]["must"].as_array().unwrap();
        assert_eq!(inner[0]["regexp"][CHANNEL_CODE], "coast*");
        assert_eq!(inner[1]["match"][PUBLISHED], true);
    }

    #[test]
    fn single_channel_pattern_is_not_unwrapped() {
        let one = Query::product().for_channels(["coast*"]);
        let two = Query::product().for_channels(["coast*", "inland*"]);
        let one_must = payload_of(&resolve(&one));
        let two_must = payload_of(&resolve(&two));
        assert_eq!(
            must_clauses(&one_must)[0]["nested"]["query"]["bool"]["must"][0]["regexp"]
                [CHANNEL_CODE],
            "coast*"
        );
        assert_eq!(
            must_clauses(&two_must)[0]["nested"]["query"]["bool"]["must"][0]["regexp"]
                [CHANNEL_CODE],
            "coast*|inland*"
        );
    }

    #[test]
    fn one_sided_lastmod_omits_missing_bound() {
        let query = Query::product().modified_between(Some(date("2024-05-01")), None);
        let payload = payload_of(&resolve(&query));
        let range = &must_clauses(&payload)[0]["range"][UPDATE_DATE];
        assert_eq!(range["gte"], "2024-05-01");
        assert!(range.get("lt").is_none());
    }

    #[test]
    fn clause_order_is_fixed() {
        let query = Query::claims()
            .removed()
            .published()
            .with_id("p-1")
            .in_municipality("Brugge")
            .filter("meta.k", "v")
            .matching("beach")
            .for_channels(["coast*"])
            .for_touristic_types(["camping", "hotel"])
            .owner("*@example.com")
            .partner("prt-9")
            .named("product_types")
            .of_year(2023)
            .modified_between(Some(date("2024-01-01")), None);
        let payload = payload_of(&resolve(&query));
        let kinds: Vec<&str> = must_clauses(&payload)
            .iter()
            .map(|clause| {
                clause
                    .as_object()
                    .unwrap()
                    .keys()
                    .next()
                    .unwrap()
                    .as_str()
            })
            .collect();
        assert_eq!(
            kinds,
            vec![
                "range", "match", "match", "match", "match", "match", "match", "nested", "terms",
                "regexp", "match", "match", "match",
            ]
        );
        let must = must_clauses(&payload);
        assert_eq!(must[1]["match"][DELETED], true);
        assert_eq!(must[3]["match"][PRODUCT_ID], "p-1");
        assert_eq!(must[4]["match"][MUNICIPALITY], "Brugge");
        assert_eq!(must[5]["match"]["meta.k"], "v");
        assert_eq!(must[6]["match"]["_all"]["query"], "beach");
        assert_eq!(must[8]["terms"][TOURISTIC_TYPE], json!(["camping", "hotel"]));
        assert_eq!(must[9]["regexp"][OWNER_EMAIL], "*@example.com");
        assert_eq!(must[10]["match"][PARTNER_ID], "prt-9");
        assert_eq!(must[11]["match"][VOCABULARY_NAME], "product_types");
        assert_eq!(must[12]["match"][STATS_YEAR], 2023);
    }

    #[test]
    fn required_fields_populate_the_filter_list() {
        let query = Query::product()
            .require_field("metadata.tdms__owner")
            .require_field("location.tdms__municipality");
        let payload = payload_of(&resolve(&query));
        assert!(payload["query"]["filtered"].get("query").is_none());
        let filters = payload["query"]["filtered"]["filter"]["bool"]["must"]
            .as_array()
            .unwrap();
        assert_eq!(filters.len(), 2);
        assert_eq!(filters[0]["exists"]["field"], "metadata.tdms__owner");
    }

    #[test]
    fn unset_filters_emit_no_payload() {
        assert!(Query::product().filter_payload().is_none());
        assert!(!resolve(&Query::product()).contains("_query="));
    }

    #[test]
    fn ignore_mutators_clear_the_flags() {
        let query = Query::product().removed().published();
        let cleared = query.ignore_removed().ignore_published();
        assert!(cleared.filter_payload().is_none());
    }

    #[test]
    fn filter_summary_names_the_set_filters() {
        let summary = Query::product()
            .published()
            .for_channels(["coast*"])
            .filter_summary();
        assert!(summary.starts_with("product:accommodation"));
        assert!(summary.contains("published=true"));
        assert!(summary.contains("channels=coast*"));
    }

    #[test]
    fn format_switches() {
        assert_eq!(Query::product().as_json().format(), Format::Json);
        assert_eq!(Query::product().as_json_hal().format(), Format::JsonHal);
        assert_eq!(
            Query::product().as_json().as_xml().format(),
            Format::Xml
        );
        assert!(resolve(&Query::product().as_json_hal()).contains("format=json%2Bhal"));
    }
}
