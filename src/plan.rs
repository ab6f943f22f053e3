//! Query planning: JSON request parsing into a [`ReshapeRequest`], operator
//! topology construction and execution into a push cursor.

use crate::column_store::ColumnStore;
use crate::error::DbError;
use crate::index::{
    suggest_metric_names, suggest_tag_names, suggest_tag_values, PlainSeriesMatcher,
    SeriesMatcher, SeriesRetriever,
};
use crate::operators::{
    aggregate_samples, group_aggregate_samples, join_samples, run_pipeline, EvalExpr,
    EventSource, InternalCursor, OrderBy, PipelineStage, QueryCancelToken, SampleSource,
    ScanSource, VecSource,
};
use crate::types::{
    AggregateComponent, AggregationResult, Sample, SeriesId, Timestamp, ValueFilter,
};
use serde_json::Value as Json;
use std::collections::HashMap;
use std::sync::Arc;

/// Recognized query shapes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryKind {
    Select,
    SelectMeta,
    SelectEvents,
    Suggest,
}

/// How per-metric value filters combine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilterCombinationRule {
    All,
    Any,
}

/// Grouping requested by the query.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GroupBy {
    None,
    /// Merge series sharing the listed tags' value tuple into one output row
    /// stream (`group-by` / `group-by-tag`).
    Tags(Vec<String>),
    /// One output series per value of the single pivot tag.
    PivotByTag(String),
}

/// Aggregation requested by the query.
#[derive(Debug, Clone, PartialEq)]
pub enum AggSpec {
    None,
    /// One result per series over the whole range; one function per metric.
    Aggregate,
    /// Bucketed by `step`.
    GroupAggregate { step: Timestamp },
    /// Column-aligned join of exactly two metrics.
    GroupAggregateJoin { step: Timestamp },
}

/// One selected column: a metric and its resolved ids.
#[derive(Debug, Clone)]
pub struct ColumnSelection {
    pub metric: String,
    pub ids: Vec<SeriesId>,
    pub funcs: Vec<AggregateComponent>,
}

/// Structured query request derived from the JSON form.
#[derive(Debug)]
pub struct ReshapeRequest {
    pub kind: QueryKind,
    pub columns: Vec<ColumnSelection>,
    pub begin: Timestamp,
    pub end: Timestamp,
    pub order_by: OrderBy,
    pub group_by: GroupBy,
    pub agg: AggSpec,
    pub filters: HashMap<String, ValueFilter>,
    pub filter_rule: FilterCombinationRule,
    pub event_body_regex: Option<String>,
    pub eval_expr: Option<EvalExpr>,
    pub absolute: bool,
    pub limit: Option<usize>,
    pub offset: usize,
    /// Suggest parameters: (select kind, metric, tag, starts-with).
    pub suggest: Option<SuggestParams>,
}

#[derive(Debug, Clone)]
pub struct SuggestParams {
    pub what: String,
    pub metric: String,
    pub tag: String,
    pub prefix: String,
}

/// Result of a query: samples plus the name table for synthetic output ids.
#[derive(Debug)]
pub struct QueryOutput {
    pub samples: Vec<Sample>,
    pub local_matcher: Option<PlainSeriesMatcher>,
}

impl QueryOutput {
    /// Resolves an output id: local (group-by/suggest) ids first, then the
    /// global index.
    pub fn series_name(
        &self,
        id: SeriesId,
        global: &SeriesMatcher,
    ) -> Result<Option<String>, DbError> {
        if let Some(local) = &self.local_matcher {
            if let Some(name) = local.id2str(id) {
                return Ok(Some(name.to_string()));
            }
        }
        Ok(global.id2str(id)?.map(|n| n.to_string()))
    }
}

// --- Timestamp parsing --- //

/// Parses a query timestamp: a raw nanosecond integer or a basic ISO 8601
/// string (`YYYYMMDDThhmmss[.fffffffff]`).
pub fn parse_timestamp(v: &Json) -> Result<Timestamp, DbError> {
    if let Some(n) = v.as_u64() {
        return Ok(n);
    }
    if let Some(s) = v.as_str() {
        if let Ok(n) = s.parse::<u64>() {
            return Ok(n);
        }
        let dt = chrono::NaiveDateTime::parse_from_str(s, "%Y%m%dT%H%M%S%.f")
            .map_err(|e| DbError::query_parsing(format!("Bad timestamp '{}': {}", s, e)))?;
        let ns = dt
            .and_utc()
            .timestamp_nanos_opt()
            .ok_or_else(|| DbError::query_parsing(format!("Timestamp '{}' out of range", s)))?;
        if ns < 0 {
            return Err(DbError::query_parsing(format!(
                "Timestamp '{}' is before the epoch",
                s
            )));
        }
        return Ok(ns as Timestamp);
    }
    Err(DbError::query_parsing("Timestamp must be integer or string"))
}

// --- JSON parsing --- //

pub fn get_query_kind(q: &Json) -> Result<QueryKind, DbError> {
    if q.get("select-events").is_some() {
        return Ok(QueryKind::SelectEvents);
    }
    if let Some(select) = q.get("select") {
        let s = select
            .as_str()
            .ok_or_else(|| DbError::query_parsing("'select' must be a string"))?;
        if s.starts_with("meta:names") {
            return Ok(QueryKind::SelectMeta);
        }
        if s == "metric-names" || s == "tag-names" || s == "tag-values" {
            return Ok(QueryKind::Suggest);
        }
        return Ok(QueryKind::Select);
    }
    if q.get("aggregate").is_some()
        || q.get("group-aggregate").is_some()
        || q.get("group-aggregate-join").is_some()
    {
        return Ok(QueryKind::Select);
    }
    Err(DbError::query_parsing(
        "Query has no 'select', 'select-events', 'aggregate' or 'group-aggregate' clause",
    ))
}

fn parse_range(q: &Json) -> Result<(Timestamp, Timestamp), DbError> {
    let Some(range) = q.get("range") else {
        return Ok((0, Timestamp::MAX));
    };
    let from = range
        .get("from")
        .map(parse_timestamp)
        .transpose()?
        .unwrap_or(0);
    let to = range
        .get("to")
        .map(parse_timestamp)
        .transpose()?
        .unwrap_or(Timestamp::MAX);
    Ok((from, to))
}

fn parse_order_by(q: &Json) -> Result<OrderBy, DbError> {
    match q.get("order-by") {
        None => Ok(OrderBy::Time),
        Some(Json::String(s)) if s == "time" => Ok(OrderBy::Time),
        Some(Json::String(s)) if s == "series" => Ok(OrderBy::Series),
        Some(other) => Err(DbError::query_parsing(format!(
            "Bad 'order-by' value {}",
            other
        ))),
    }
}

fn string_list(v: &Json, key: &str) -> Result<Vec<String>, DbError> {
    match v {
        Json::String(s) => Ok(vec![s.clone()]),
        Json::Array(items) => items
            .iter()
            .map(|i| {
                i.as_str()
                    .map(str::to_string)
                    .ok_or_else(|| DbError::query_parsing(format!("'{}' must hold strings", key)))
            })
            .collect(),
        _ => Err(DbError::query_parsing(format!(
            "'{}' must be a string or list of strings",
            key
        ))),
    }
}

fn parse_group_by(q: &Json) -> Result<GroupBy, DbError> {
    if let Some(v) = q.get("pivot-by-tag") {
        let tags = string_list(v, "pivot-by-tag")?;
        if tags.len() != 1 {
            return Err(DbError::query_parsing(
                "'pivot-by-tag' takes exactly one tag",
            ));
        }
        return Ok(GroupBy::PivotByTag(tags.into_iter().next().expect("len 1")));
    }
    for key in ["group-by", "group-by-tag"] {
        if let Some(v) = q.get(key) {
            let tags = string_list(v, key)?;
            if tags.is_empty() {
                return Err(DbError::query_parsing(format!("'{}' needs a tag", key)));
            }
            return Ok(GroupBy::Tags(tags));
        }
    }
    Ok(GroupBy::None)
}

fn parse_value_filter(v: &Json) -> Result<ValueFilter, DbError> {
    let obj = v
        .as_object()
        .ok_or_else(|| DbError::query_parsing("'filter' entries must be objects"))?;
    let mut filter = ValueFilter::default();
    for (key, bound) in obj {
        let n = bound
            .as_f64()
            .ok_or_else(|| DbError::query_parsing(format!("Filter bound '{}' must be numeric", key)))?;
        filter = match key.as_str() {
            "gt" => filter.greater_than(n),
            "lt" => filter.less_than(n),
            "ge" => filter.greater_or_equal(n),
            "le" => filter.less_or_equal(n),
            other => {
                return Err(DbError::query_parsing(format!(
                    "Unknown filter predicate '{}'",
                    other
                )))
            }
        };
    }
    Ok(filter)
}

fn parse_filters(q: &Json) -> Result<(HashMap<String, ValueFilter>, Option<String>), DbError> {
    let mut filters = HashMap::new();
    let mut event_regex = None;
    match q.get("filter") {
        None => {}
        Some(Json::String(re)) => event_regex = Some(re.clone()),
        Some(Json::Object(map)) => {
            for (metric, flt) in map {
                filters.insert(metric.clone(), parse_value_filter(flt)?);
            }
        }
        Some(other) => {
            return Err(DbError::query_parsing(format!(
                "Bad 'filter' clause {}",
                other
            )))
        }
    }
    Ok((filters, event_regex))
}

fn parse_filter_rule(q: &Json) -> Result<FilterCombinationRule, DbError> {
    match q.get("filter-rule") {
        None => Ok(FilterCombinationRule::All),
        Some(Json::String(s)) if s == "all" => Ok(FilterCombinationRule::All),
        Some(Json::String(s)) if s == "any" => Ok(FilterCombinationRule::Any),
        Some(other) => Err(DbError::query_parsing(format!(
            "Bad 'filter-rule' value {}",
            other
        ))),
    }
}

/// Builds the retrievers encoded by a `where` clause. An object is one
/// constraint set (values AND across keys, OR within a key's list); an array
/// of objects ORs the sets; an array of `key=value` strings ANDs scalars. An
/// empty metric leaves the metric unconstrained.
fn parse_where(q: &Json, metric: &str) -> Result<Vec<SeriesRetriever>, DbError> {
    let base = || {
        if metric.is_empty() {
            SeriesRetriever::new()
        } else {
            SeriesRetriever::with_metrics(vec![metric.to_string()])
        }
    };
    let Some(where_clause) = q.get("where") else {
        return Ok(vec![base()]);
    };
    match where_clause {
        Json::Object(map) => {
            let mut r = base();
            add_constraints(&mut r, map)?;
            Ok(vec![r])
        }
        Json::Array(items) if items.iter().all(|i| i.is_string()) => {
            let mut r = base();
            for item in items {
                let text = item.as_str().expect("checked string");
                let (k, v) = text.split_once('=').ok_or_else(|| {
                    DbError::query_parsing(format!("Bad 'where' predicate '{}'", text))
                })?;
                r.add_tag(k, v)?;
            }
            Ok(vec![r])
        }
        Json::Array(items) => {
            let mut out = Vec::with_capacity(items.len());
            for item in items {
                let map = item.as_object().ok_or_else(|| {
                    DbError::query_parsing("'where' array must hold objects or strings")
                })?;
                let mut r = base();
                add_constraints(&mut r, map)?;
                out.push(r);
            }
            Ok(out)
        }
        other => Err(DbError::query_parsing(format!(
            "Bad 'where' clause {}",
            other
        ))),
    }
}

fn add_constraints(
    r: &mut SeriesRetriever,
    map: &serde_json::Map<String, Json>,
) -> Result<(), DbError> {
    for (tag, value) in map {
        match value {
            Json::Array(values) => {
                let values: Vec<String> = values
                    .iter()
                    .map(json_scalar_to_string)
                    .collect::<Result<_, _>>()?;
                let refs: Vec<&str> = values.iter().map(String::as_str).collect();
                r.add_tags(tag, &refs)?;
            }
            v => {
                r.add_tag(tag, &json_scalar_to_string(v)?)?;
            }
        }
    }
    Ok(())
}

fn json_scalar_to_string(v: &Json) -> Result<String, DbError> {
    match v {
        Json::String(s) => Ok(s.clone()),
        Json::Number(n) => Ok(n.to_string()),
        Json::Bool(b) => Ok(b.to_string()),
        other => Err(DbError::query_parsing(format!(
            "Tag predicate must be scalar, got {}",
            other
        ))),
    }
}

fn resolve_ids(
    q: &Json,
    metric: &str,
    matcher: &SeriesMatcher,
) -> Result<Vec<SeriesId>, DbError> {
    let retrievers = parse_where(q, metric)?;
    let mut out: Vec<SeriesId> = Vec::new();
    for r in retrievers {
        for id in r.extract_ids(matcher)? {
            if !out.contains(&id) {
                out.push(id);
            }
        }
    }
    Ok(out)
}

fn parse_limit_offset(q: &Json) -> Result<(Option<usize>, usize), DbError> {
    let limit = match q.get("limit") {
        None => None,
        Some(v) => Some(
            v.as_u64()
                .ok_or_else(|| DbError::query_parsing("'limit' must be a non-negative integer"))?
                as usize,
        ),
    };
    let offset = match q.get("offset") {
        None => 0,
        Some(v) => v
            .as_u64()
            .ok_or_else(|| DbError::query_parsing("'offset' must be a non-negative integer"))?
            as usize,
    };
    Ok((limit, offset))
}

/// Parses the whole JSON request into a [`ReshapeRequest`].
pub fn parse_query(text: &str, matcher: &SeriesMatcher) -> Result<ReshapeRequest, DbError> {
    let q: Json = serde_json::from_str(text)
        .map_err(|e| DbError::query_parsing(format!("Bad query JSON: {}", e)))?;
    let kind = get_query_kind(&q)?;
    let (begin, end) = parse_range(&q)?;
    let order_by = parse_order_by(&q)?;
    let group_by = parse_group_by(&q)?;
    let (filters, filter_event_regex) = parse_filters(&q)?;
    let filter_rule = parse_filter_rule(&q)?;
    let (limit, offset) = parse_limit_offset(&q)?;
    let eval_expr = match q.get("eval") {
        None => None,
        Some(Json::String(s)) => Some(EvalExpr::parse(s)?),
        Some(other) => {
            return Err(DbError::query_parsing(format!(
                "Bad 'eval' clause {}",
                other
            )))
        }
    };
    let absolute = match q.get("apply") {
        None => false,
        Some(v) => string_list(v, "apply")?.iter().any(|s| s == "absolute"),
    };

    let mut req = ReshapeRequest {
        kind,
        columns: Vec::new(),
        begin,
        end,
        order_by,
        group_by,
        agg: AggSpec::None,
        filters,
        filter_rule,
        event_body_regex: None,
        eval_expr,
        absolute,
        limit,
        offset,
        suggest: None,
    };

    match kind {
        QueryKind::Suggest => {
            let what = q
                .get("select")
                .and_then(Json::as_str)
                .unwrap_or_default()
                .to_string();
            let metric = q
                .get("metric")
                .and_then(Json::as_str)
                .unwrap_or_default()
                .to_string();
            let tag = q
                .get("tag")
                .and_then(Json::as_str)
                .unwrap_or_default()
                .to_string();
            let prefix = q
                .get("starts-with")
                .and_then(Json::as_str)
                .unwrap_or_default()
                .to_string();
            if what != "metric-names" && metric.is_empty() {
                return Err(DbError::query_parsing(
                    "Suggest query needs a 'metric' parameter",
                ));
            }
            if what == "tag-values" && tag.is_empty() {
                return Err(DbError::query_parsing(
                    "'tag-values' suggest needs a 'tag' parameter",
                ));
            }
            req.suggest = Some(SuggestParams {
                what,
                metric,
                tag,
                prefix,
            });
        }
        QueryKind::SelectMeta => {
            // `meta:names` optionally carries a metric suffix.
            let select = q.get("select").and_then(Json::as_str).unwrap_or_default();
            let metric = select
                .trim_start_matches("meta:names")
                .trim_start_matches(':');
            let ids = resolve_ids(&q, metric, matcher)?;
            req.columns.push(ColumnSelection {
                metric: metric.to_string(),
                ids,
                funcs: Vec::new(),
            });
        }
        QueryKind::SelectEvents => {
            let select = q
                .get("select-events")
                .and_then(Json::as_str)
                .ok_or_else(|| DbError::query_parsing("'select-events' must be a string"))?;
            if !select.starts_with('!') {
                return Err(DbError::query_parsing(
                    "'select-events' metric must start with '!'",
                ));
            }
            let ids = resolve_ids(&q, select, matcher)?;
            req.event_body_regex = filter_event_regex;
            req.columns.push(ColumnSelection {
                metric: select.to_string(),
                ids,
                funcs: Vec::new(),
            });
        }
        QueryKind::Select => {
            if let Some(select) = q.get("select") {
                let metric = select
                    .as_str()
                    .ok_or_else(|| DbError::query_parsing("'select' must be a string"))?;
                let ids = resolve_ids(&q, metric, matcher)?;
                req.columns.push(ColumnSelection {
                    metric: metric.to_string(),
                    ids,
                    funcs: Vec::new(),
                });
            } else if let Some(agg) = q.get("aggregate") {
                let map = agg
                    .as_object()
                    .ok_or_else(|| DbError::query_parsing("'aggregate' must be an object"))?;
                for (metric, func) in map {
                    let funcs: Vec<AggregateComponent> = string_list(func, "aggregate")?
                        .iter()
                        .map(|f| AggregateComponent::parse(f))
                        .collect::<Result<_, _>>()?;
                    let ids = resolve_ids(&q, metric, matcher)?;
                    req.columns.push(ColumnSelection {
                        metric: metric.clone(),
                        ids,
                        funcs,
                    });
                }
                req.agg = AggSpec::Aggregate;
            } else {
                let (key, join) = if q.get("group-aggregate").is_some() {
                    ("group-aggregate", false)
                } else {
                    ("group-aggregate-join", true)
                };
                let ga = q
                    .get(key)
                    .and_then(Json::as_object)
                    .ok_or_else(|| DbError::query_parsing(format!("'{}' must be an object", key)))?;
                let metrics = string_list(
                    ga.get("metric")
                        .ok_or_else(|| DbError::query_parsing("Missing 'metric'"))?,
                    "metric",
                )?;
                let step = ga
                    .get("step")
                    .and_then(Json::as_u64)
                    .ok_or_else(|| DbError::query_parsing("Missing or bad 'step'"))?;
                if step == 0 {
                    return Err(DbError::query_parsing("'step' must be positive"));
                }
                let funcs: Vec<AggregateComponent> = string_list(
                    ga.get("func")
                        .ok_or_else(|| DbError::query_parsing("Missing 'func'"))?,
                    "func",
                )?
                .iter()
                .map(|f| AggregateComponent::parse(f))
                .collect::<Result<_, _>>()?;
                if join {
                    if metrics.len() != 2 {
                        return Err(DbError::query_parsing(
                            "'group-aggregate-join' takes exactly two metrics",
                        ));
                    }
                    if funcs.len() != 1 {
                        return Err(DbError::query_parsing(
                            "'group-aggregate-join' takes a single aggregation function",
                        ));
                    }
                    if matches!(req.group_by, GroupBy::PivotByTag(_)) {
                        return Err(DbError::query_parsing(
                            "'pivot-by-tag' is not permitted with 'group-aggregate-join'",
                        ));
                    }
                }
                for metric in metrics {
                    let ids = resolve_ids(&q, &metric, matcher)?;
                    req.columns.push(ColumnSelection {
                        metric,
                        ids,
                        funcs: funcs.clone(),
                    });
                }
                req.agg = if join {
                    AggSpec::GroupAggregateJoin { step }
                } else {
                    AggSpec::GroupAggregate { step }
                };
            }
        }
    }
    Ok(req)
}

// --- Grouping helpers --- //

fn group_by_tags(group_by: &GroupBy) -> Vec<String> {
    match group_by {
        GroupBy::Tags(tags) => tags.clone(),
        GroupBy::PivotByTag(tag) => vec![tag.clone()],
        GroupBy::None => Vec::new(),
    }
}

/// Groups `ids` by the value tuple of `tags` within their canonical names.
/// Output names (`metric tag=value ...` restricted to the listed tags) are
/// registered in a local matcher; groups appear in series order.
fn build_tag_groups(
    ids: &[SeriesId],
    tags: &[String],
    matcher: &SeriesMatcher,
    local: &mut PlainSeriesMatcher,
) -> Result<Vec<(SeriesId, Vec<SeriesId>)>, DbError> {
    let mut order: Vec<SeriesId> = Vec::new();
    let mut groups: HashMap<SeriesId, Vec<SeriesId>> = HashMap::new();
    for &id in ids {
        let Some(name) = matcher.id2str(id)? else {
            return Err(DbError::NotFound(format!("Series {} has no name", id)));
        };
        let mut parts = name.split(' ');
        let metric = parts.next().unwrap_or_default();
        let mut selected: Vec<(&str, &str)> = Vec::new();
        for tok in parts {
            if let Some((k, v)) = tok.split_once('=') {
                if tags.iter().any(|t| t == k) {
                    selected.push((k, v));
                }
            }
        }
        selected.sort();
        let mut out_name = metric.to_string();
        for (k, v) in selected {
            out_name.push(' ');
            out_name.push_str(k);
            out_name.push('=');
            out_name.push_str(v);
        }
        let out_id = local.add(&out_name);
        if !groups.contains_key(&out_id) {
            order.push(out_id);
        }
        groups.entry(out_id).or_default().push(id);
    }
    Ok(order
        .into_iter()
        .map(|out_id| {
            let members = groups.remove(&out_id).unwrap_or_default();
            (out_id, members)
        })
        .collect())
}

/// Merges per-member bucket lists into one list per group, combining
/// aggregates of coinciding buckets.
fn merge_group_buckets(
    member_buckets: Vec<Vec<(Timestamp, AggregationResult)>>,
) -> Vec<(Timestamp, AggregationResult)> {
    let mut merged: Vec<(Timestamp, AggregationResult)> = Vec::new();
    for buckets in member_buckets {
        for (ts, agg) in buckets {
            match merged.binary_search_by_key(&ts, |b| b.0) {
                Ok(i) => merged[i].1.combine(&agg),
                Err(i) => merged.insert(i, (ts, agg)),
            }
        }
    }
    merged
}

// --- Execution --- //

struct LimitingCursor<'a> {
    inner: &'a mut dyn InternalCursor,
    offset: usize,
    remaining: Option<usize>,
}

impl<'a> InternalCursor for LimitingCursor<'a> {
    fn put(&mut self, sample: Sample) -> bool {
        if self.offset > 0 {
            self.offset -= 1;
            return true;
        }
        match &mut self.remaining {
            Some(0) => false,
            Some(n) => {
                *n -= 1;
                let more = self.inner.put(sample);
                more && *n > 0
            }
            None => self.inner.put(sample),
        }
    }

    fn complete(&mut self) {
        self.inner.complete();
    }

    fn set_error(&mut self, err: DbError) {
        self.inner.set_error(err);
    }
}

/// Plans and runs a parsed request, pushing results into `cursor`.
pub fn execute_request(
    req: &ReshapeRequest,
    cstore: &ColumnStore,
    matcher: &SeriesMatcher,
    cursor: &mut dyn InternalCursor,
    cancel: &QueryCancelToken,
) -> Result<Option<PlainSeriesMatcher>, DbError> {
    let descending = req.begin > req.end;
    let mut local = PlainSeriesMatcher::new(crate::types::STARTING_SERIES_ID);
    let mut used_local = false;

    let mut source: Box<dyn SampleSource> = match req.kind {
        QueryKind::Suggest => {
            let p = req.suggest.as_ref().ok_or_else(|| {
                DbError::Internal("Suggest request without parameters".to_string())
            })?;
            let (m, ids) = match p.what.as_str() {
                "metric-names" => suggest_metric_names(matcher, &p.prefix)?,
                "tag-names" => suggest_tag_names(matcher, &p.metric, &p.prefix)?,
                "tag-values" => suggest_tag_values(matcher, &p.metric, &p.tag, &p.prefix)?,
                other => {
                    return Err(DbError::query_parsing(format!(
                        "Unknown suggest kind '{}'",
                        other
                    )))
                }
            };
            local = m;
            used_local = true;
            let samples = ids
                .into_iter()
                .map(|id| Sample::float(id, 0, 0.0))
                .collect();
            Box::new(VecSource::new(samples))
        }
        QueryKind::SelectMeta => {
            let ids = &req.columns[0].ids;
            if ids.is_empty() {
                return Err(DbError::NotFound(
                    "No series match the metadata query".to_string(),
                ));
            }
            let samples = ids.iter().map(|&id| Sample::float(id, 0, 0.0)).collect();
            Box::new(VecSource::new(samples))
        }
        QueryKind::SelectEvents => {
            let ids = &req.columns[0].ids;
            let scans = match &req.event_body_regex {
                Some(re) => cstore.filter_events(ids, req.begin, req.end, re)?,
                None => cstore.scan_events(ids, req.begin, req.end)?,
            };
            Box::new(EventSource::new(scans, req.order_by, descending))
        }
        QueryKind::Select => match &req.agg {
            AggSpec::None => {
                let col = &req.columns[0];
                let id_filters = metric_filters_to_ids(req, cstore)?;
                let scans = if req.filter_rule == FilterCombinationRule::All
                    && !id_filters.is_empty()
                {
                    cstore.filter(&col.ids, req.begin, req.end, &id_filters)?
                } else {
                    cstore.scan(&col.ids, req.begin, req.end)?
                };
                match &req.group_by {
                    GroupBy::None => {
                        Box::new(ScanSource::flat(scans, req.order_by, descending))
                    }
                    GroupBy::Tags(_) | GroupBy::PivotByTag(_) => {
                        let tags = group_by_tags(&req.group_by);
                        used_local = true;
                        let groups = build_tag_groups(&col.ids, &tags, matcher, &mut local)?;
                        let mut scan_by_id: HashMap<SeriesId, crate::nbtree::SeriesScan> =
                            col.ids.iter().copied().zip(scans).collect();
                        let grouped = groups
                            .into_iter()
                            .map(|(out_id, members)| {
                                let member_scans = members
                                    .iter()
                                    .filter_map(|m| scan_by_id.remove(m))
                                    .collect();
                                (out_id, member_scans)
                            })
                            .collect();
                        Box::new(ScanSource::new(grouped, req.order_by, descending))
                    }
                }
            }
            AggSpec::Aggregate => {
                let mut samples = Vec::new();
                for col in &req.columns {
                    let results = cstore.aggregate(&col.ids, req.begin, req.end)?;
                    match &req.group_by {
                        GroupBy::None => {
                            let funcs = col.funcs.clone();
                            samples.extend(aggregate_samples(
                                &col.ids,
                                &results,
                                |_| funcs.clone(),
                                req.begin.min(req.end),
                            )?);
                        }
                        GroupBy::Tags(_) | GroupBy::PivotByTag(_) => {
                            let tags = group_by_tags(&req.group_by);
                            used_local = true;
                            let groups =
                                build_tag_groups(&col.ids, &tags, matcher, &mut local)?;
                            let by_id: HashMap<SeriesId, AggregationResult> =
                                col.ids.iter().copied().zip(results).collect();
                            for (out_id, members) in groups {
                                let mut agg = AggregationResult::default();
                                for m in members {
                                    if let Some(r) = by_id.get(&m) {
                                        agg.combine(r);
                                    }
                                }
                                if agg.cnt > 0 {
                                    samples.push(crate::operators::aggregate_tuple(
                                        out_id,
                                        req.begin.min(req.end),
                                        &agg,
                                        &col.funcs,
                                    )?);
                                }
                            }
                        }
                    }
                }
                Box::new(VecSource::new(samples))
            }
            AggSpec::GroupAggregate { step } => {
                let mut samples = Vec::new();
                for col in &req.columns {
                    let agg_filters = aggregate_filters_for(req, col)?;
                    let buckets = if agg_filters.is_empty() {
                        cstore.group_aggregate(&col.ids, req.begin, req.end, *step)?
                    } else {
                        cstore.group_aggfilter(
                            &col.ids,
                            req.begin,
                            req.end,
                            *step,
                            &agg_filters,
                        )?
                    };
                    match &req.group_by {
                        GroupBy::None => {
                            samples.extend(group_aggregate_samples(
                                &col.ids,
                                buckets,
                                &col.funcs,
                                req.order_by,
                                descending,
                            )?);
                        }
                        GroupBy::Tags(_) | GroupBy::PivotByTag(_) => {
                            let tags = group_by_tags(&req.group_by);
                            used_local = true;
                            let groups =
                                build_tag_groups(&col.ids, &tags, matcher, &mut local)?;
                            let mut by_id: HashMap<
                                SeriesId,
                                Vec<(Timestamp, AggregationResult)>,
                            > = col.ids.iter().copied().zip(buckets).collect();
                            let mut out_ids = Vec::new();
                            let mut merged = Vec::new();
                            for (out_id, members) in groups {
                                let member_buckets: Vec<_> = members
                                    .iter()
                                    .filter_map(|m| by_id.remove(m))
                                    .collect();
                                out_ids.push(out_id);
                                merged.push(merge_group_buckets(member_buckets));
                            }
                            samples.extend(group_aggregate_samples(
                                &out_ids,
                                merged,
                                &col.funcs,
                                req.order_by,
                                descending,
                            )?);
                        }
                    }
                }
                if req.columns.len() > 1 && req.order_by == OrderBy::Time {
                    if descending {
                        samples.sort_by(|a, b| {
                            b.timestamp.cmp(&a.timestamp).then_with(|| a.id.cmp(&b.id))
                        });
                    } else {
                        samples.sort_by(|a, b| {
                            a.timestamp.cmp(&b.timestamp).then_with(|| a.id.cmp(&b.id))
                        });
                    }
                }
                Box::new(VecSource::new(samples))
            }
            AggSpec::GroupAggregateJoin { step } => {
                used_local = true;
                let samples = plan_join(req, *step, cstore, matcher, &mut local)?;
                Box::new(VecSource::new(samples))
            }
        },
    };

    let mut stages: Vec<PipelineStage> = Vec::new();
    if req.filter_rule == FilterCombinationRule::Any && !req.filters.is_empty() {
        // The ANY rule cannot be pushed into per-series scans: a sample
        // passes when any metric's predicate accepts it.
        let merged: Vec<ValueFilter> = req.filters.values().copied().collect();
        stages.push(PipelineStage::AnyFilter(merged));
    }
    if req.absolute {
        stages.push(PipelineStage::Absolute);
    }
    if let Some(expr) = &req.eval_expr {
        stages.push(PipelineStage::Eval(expr.clone()));
    }

    let mut limiting = LimitingCursor {
        inner: cursor,
        offset: req.offset,
        remaining: req.limit,
    };
    run_pipeline(source.as_mut(), &stages, &mut limiting, cancel);
    Ok(if used_local { Some(local) } else { None })
}

fn metric_filters_to_ids(
    req: &ReshapeRequest,
    _cstore: &ColumnStore,
) -> Result<HashMap<SeriesId, ValueFilter>, DbError> {
    let mut out = HashMap::new();
    for col in &req.columns {
        if let Some(f) = req.filters.get(&col.metric) {
            for &id in &col.ids {
                out.insert(id, *f);
            }
        }
    }
    Ok(out)
}

fn aggregate_filters_for(
    req: &ReshapeRequest,
    col: &ColumnSelection,
) -> Result<HashMap<SeriesId, crate::types::AggregateFilter>, DbError> {
    let mut out = HashMap::new();
    if let Some(f) = req.filters.get(&col.metric) {
        let component = col
            .funcs
            .first()
            .copied()
            .unwrap_or(AggregateComponent::Last);
        for &id in &col.ids {
            out.insert(
                id,
                crate::types::AggregateFilter {
                    component,
                    filter: *f,
                },
            );
        }
    }
    Ok(out)
}

/// Pairs the two joined columns by tag suffix and materializes the joined
/// bucket stream.
fn plan_join(
    req: &ReshapeRequest,
    step: Timestamp,
    cstore: &ColumnStore,
    matcher: &SeriesMatcher,
    local: &mut PlainSeriesMatcher,
) -> Result<Vec<Sample>, DbError> {
    let left = &req.columns[0];
    let right = &req.columns[1];
    let func = left
        .funcs
        .first()
        .copied()
        .ok_or_else(|| DbError::query_parsing("Join needs an aggregation function"))?;

    // Tag suffix (everything after the metric) keys the pairing.
    let suffix_of = |id: SeriesId| -> Result<Option<(String, SeriesId)>, DbError> {
        let Some(name) = matcher.id2str(id)? else {
            return Ok(None);
        };
        let suffix = name
            .split_once(' ')
            .map(|(_, rest)| rest.to_string())
            .unwrap_or_default();
        Ok(Some((suffix, id)))
    };
    let mut right_by_suffix: HashMap<String, SeriesId> = HashMap::new();
    for &id in &right.ids {
        if let Some((suffix, id)) = suffix_of(id)? {
            right_by_suffix.insert(suffix, id);
        }
    }

    let left_buckets = cstore.group_aggregate(&left.ids, req.begin, req.end, step)?;
    let mut pairs = Vec::new();
    for (&lid, lbuckets) in left.ids.iter().zip(left_buckets) {
        let Some((suffix, _)) = suffix_of(lid)? else {
            continue;
        };
        let Some(&rid) = right_by_suffix.get(&suffix) else {
            continue;
        };
        let rbuckets = cstore
            .group_aggregate(&[rid], req.begin, req.end, step)?
            .pop()
            .unwrap_or_default();
        let out_name = format!("{}|{} {}", left.metric, right.metric, suffix);
        let out_id = local.add(out_name.trim_end());
        pairs.push((out_id, lbuckets, rbuckets));
    }
    join_samples(pairs, func, req.order_by, req.begin > req.end)
}

/// Parses and executes a JSON query against the column store and series
/// index, collecting the output.
pub fn execute_query(
    text: &str,
    cstore: &Arc<ColumnStore>,
    matcher: &SeriesMatcher,
    cancel: &QueryCancelToken,
) -> Result<QueryOutput, DbError> {
    let req = parse_query(text, matcher)?;
    let mut cursor = crate::operators::CollectingCursor::default();
    let local = execute_request(&req, cstore, matcher, &mut cursor, cancel)?;
    if let Some(err) = cursor.error {
        return Err(err);
    }
    Ok(QueryOutput {
        samples: cursor.samples,
        local_matcher: local,
    })
}
