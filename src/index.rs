//! Series index: canonicalization of `metric tag=value ...` names, dense id
//! issuance with forward and inverse lookup, tag/regex based id extraction and
//! name suggestion.

use crate::error::DbError;
use crate::types::{SeriesId, EVENT_ID_FLAG, MAX_SNAME, STARTING_SERIES_ID};
use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, RwLock};

/// A canonicalized series name: metric followed by tags sorted by key,
/// single-space separated.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CanonicalName {
    pub text: String,
    /// Byte length of the metric component.
    pub metric_len: usize,
}

impl CanonicalName {
    pub fn metric(&self) -> &str {
        &self.text[..self.metric_len]
    }

    pub fn tags(&self) -> impl Iterator<Item = (&str, &str)> {
        self.text[self.metric_len..]
            .split_ascii_whitespace()
            .filter_map(|tok| tok.split_once('='))
    }
}

/// Parses a raw `metric tag=value ...` series name into canonical form: tags
/// sorted lexicographically by key, one space between tokens. At least one tag
/// is required; duplicate keys and malformed tokens are `BadData`.
pub fn to_canonical_form(raw: &str) -> Result<CanonicalName, DbError> {
    let mut parts = raw.split_ascii_whitespace();
    let metric = parts
        .next()
        .ok_or_else(|| DbError::BadData("Empty series name".to_string()))?;
    let mut tags: Vec<(&str, &str)> = Vec::new();
    for tok in parts {
        let (key, value) = tok.split_once('=').ok_or_else(|| {
            DbError::BadData(format!("Malformed tag '{}' in series name", tok))
        })?;
        if key.is_empty() || value.is_empty() {
            return Err(DbError::BadData(format!(
                "Empty tag key or value in '{}'",
                tok
            )));
        }
        tags.push((key, value));
    }
    if tags.is_empty() {
        return Err(DbError::BadData(format!(
            "Series name '{}' has no tags",
            raw
        )));
    }
    tags.sort_by(|a, b| a.0.cmp(b.0));
    for pair in tags.windows(2) {
        if pair[0].0 == pair[1].0 {
            return Err(DbError::BadData(format!(
                "Duplicate tag key '{}' in series name",
                pair[0].0
            )));
        }
    }
    let mut text = String::with_capacity(raw.len());
    text.push_str(metric);
    for (k, v) in &tags {
        text.push(' ');
        text.push_str(k);
        text.push('=');
        text.push_str(v);
    }
    if text.len() > MAX_SNAME {
        return Err(DbError::BadData(format!(
            "Canonical series name of {} bytes exceeds limit {}",
            text.len(),
            MAX_SNAME
        )));
    }
    Ok(CanonicalName {
        text,
        metric_len: metric.len(),
    })
}

/// Splits the compound `metric1|metric2|... tags` form into one raw name per
/// metric, all sharing the tag suffix.
pub fn split_compound_name(raw: &str) -> Result<Vec<String>, DbError> {
    let (metrics, tags) = match raw.find(char::is_whitespace) {
        Some(pos) => (&raw[..pos], &raw[pos..]),
        None => (raw, ""),
    };
    if metrics.is_empty() {
        return Err(DbError::BadData("Empty series name".to_string()));
    }
    Ok(metrics
        .split('|')
        .filter(|m| !m.is_empty())
        .map(|m| format!("{}{}", m, tags))
        .collect())
}

#[derive(Debug)]
struct MatcherInner {
    table: HashMap<Arc<str>, SeriesId>,
    inv_table: HashMap<SeriesId, Arc<str>>,
    next_id: SeriesId,
    /// Names registered since the last `pull_new_series` drain.
    recently_added: Vec<(SeriesId, Arc<str>)>,
}

/// Table that maps canonical series names to dense ids and back. Ids start at
/// [`STARTING_SERIES_ID`] and only ever grow; event series (metric prefixed
/// with `!`) receive the event id bit on top of the same counter.
#[derive(Debug)]
pub struct SeriesMatcher {
    inner: RwLock<MatcherInner>,
}

impl Default for SeriesMatcher {
    fn default() -> Self {
        Self::new(STARTING_SERIES_ID)
    }
}

impl SeriesMatcher {
    pub fn new(starting_id: SeriesId) -> Self {
        SeriesMatcher {
            inner: RwLock::new(MatcherInner {
                table: HashMap::new(),
                inv_table: HashMap::new(),
                next_id: starting_id,
                recently_added: Vec::new(),
            }),
        }
    }

    /// Canonicalizes and registers a raw name. Idempotent: an existing name
    /// returns its original id.
    pub fn add(&self, raw: &str) -> Result<SeriesId, DbError> {
        let canonical = to_canonical_form(raw)?;
        self.add_canonical(&canonical)
    }

    pub fn add_canonical(&self, canonical: &CanonicalName) -> Result<SeriesId, DbError> {
        let mut inner = self.inner.write()?;
        if let Some(&id) = inner.table.get(canonical.text.as_str()) {
            return Ok(id);
        }
        let base = inner.next_id;
        inner.next_id += 1;
        let id = if canonical.metric().starts_with('!') {
            base | EVENT_ID_FLAG
        } else {
            base
        };
        let name: Arc<str> = Arc::from(canonical.text.as_str());
        inner.table.insert(Arc::clone(&name), id);
        inner.inv_table.insert(id, Arc::clone(&name));
        inner.recently_added.push((id, name));
        Ok(id)
    }

    /// Registers a name under a fixed id; recovery uses this to preserve the
    /// original assignment. The id counter advances past the given id.
    pub fn register(&self, canonical: &str, id: SeriesId) -> Result<(), DbError> {
        let mut inner = self.inner.write()?;
        let name: Arc<str> = Arc::from(canonical);
        inner.table.insert(Arc::clone(&name), id);
        inner.inv_table.insert(id, name);
        let base = id & !EVENT_ID_FLAG;
        if base >= inner.next_id {
            inner.next_id = base + 1;
        }
        Ok(())
    }

    /// Resolves the compound `m1|m2|... tags` form: one id per metric, all
    /// sharing the tag suffix. Names are registered as needed.
    pub fn name_to_param_id_list(&self, raw: &str) -> Result<Vec<SeriesId>, DbError> {
        let names = split_compound_name(raw)?;
        names.iter().map(|n| self.add(n)).collect()
    }

    /// Looks a raw name up without registering; `None` when the name is new.
    pub fn match_name(&self, raw: &str) -> Result<Option<SeriesId>, DbError> {
        let canonical = to_canonical_form(raw)?;
        Ok(self
            .inner
            .read()?
            .table
            .get(canonical.text.as_str())
            .copied())
    }

    pub fn id2str(&self, id: SeriesId) -> Result<Option<Arc<str>>, DbError> {
        Ok(self.inner.read()?.inv_table.get(&id).cloned())
    }

    /// Drains names registered since the previous pull; used to mirror new
    /// series into the metadata catalog.
    pub fn pull_new_series(&self) -> Result<Vec<(SeriesId, Arc<str>)>, DbError> {
        Ok(std::mem::take(&mut self.inner.write()?.recently_added))
    }

    /// All `(id, name)` pairs, sorted by canonical name.
    pub fn all_series(&self) -> Result<Vec<(SeriesId, Arc<str>)>, DbError> {
        let inner = self.inner.read()?;
        let mut out: Vec<(SeriesId, Arc<str>)> = inner
            .table
            .iter()
            .map(|(name, &id)| (id, Arc::clone(name)))
            .collect();
        out.sort_by(|a, b| a.1.cmp(&b.1));
        Ok(out)
    }

    pub fn regex_match(&self, pattern: &str) -> Result<Vec<(SeriesId, Arc<str>)>, DbError> {
        let re = regex::Regex::new(pattern)
            .map_err(|e| DbError::BadArg(format!("Bad series regex: {}", e)))?;
        let mut out: Vec<(SeriesId, Arc<str>)> = self
            .inner
            .read()?
            .table
            .iter()
            .filter(|(name, _)| re.is_match(name))
            .map(|(name, &id)| (id, Arc::clone(name)))
            .collect();
        out.sort_by(|a, b| a.1.cmp(&b.1));
        Ok(out)
    }
}

/// Unsynchronized name table used for query-local results: group-by output
/// rows and suggestion strings get synthetic ids resolvable via `id2str`.
#[derive(Debug, Default)]
pub struct PlainSeriesMatcher {
    table: HashMap<Arc<str>, SeriesId>,
    inv_table: HashMap<SeriesId, Arc<str>>,
    next_id: SeriesId,
}

impl PlainSeriesMatcher {
    pub fn new(starting_id: SeriesId) -> Self {
        PlainSeriesMatcher {
            table: HashMap::new(),
            inv_table: HashMap::new(),
            next_id: starting_id,
        }
    }

    /// Registers a string verbatim (no canonicalization) and returns its id.
    pub fn add(&mut self, name: &str) -> SeriesId {
        if let Some(&id) = self.table.get(name) {
            return id;
        }
        let id = self.next_id;
        self.next_id += 1;
        let name: Arc<str> = Arc::from(name);
        self.table.insert(Arc::clone(&name), id);
        self.inv_table.insert(id, name);
        id
    }

    pub fn id2str(&self, id: SeriesId) -> Option<Arc<str>> {
        self.inv_table.get(&id).cloned()
    }

    pub fn len(&self) -> usize {
        self.table.len()
    }

    pub fn is_empty(&self) -> bool {
        self.table.is_empty()
    }
}

// --- Retriever --- //

/// Query-time extraction of series ids by metric and tag constraints. Tag
/// predicates AND across keys and OR within a key's value set.
#[derive(Debug, Default, Clone)]
pub struct SeriesRetriever {
    metrics: Vec<String>,
    tags: HashMap<String, HashSet<String>>,
}

impl SeriesRetriever {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_metrics(metrics: Vec<String>) -> Self {
        SeriesRetriever {
            metrics,
            tags: HashMap::new(),
        }
    }

    /// Adds a single-value constraint. Re-adding a key is `BadArg`.
    pub fn add_tag(&mut self, name: &str, value: &str) -> Result<(), DbError> {
        self.add_tags(name, &[value])
    }

    /// Adds a set-membership constraint. Re-adding a key or passing an empty
    /// value set is `BadArg`.
    pub fn add_tags(&mut self, name: &str, values: &[&str]) -> Result<(), DbError> {
        if values.is_empty() {
            return Err(DbError::BadArg(format!(
                "Empty predicate set for tag '{}'",
                name
            )));
        }
        if self.tags.contains_key(name) {
            return Err(DbError::BadArg(format!(
                "Tag '{}' was already constrained",
                name
            )));
        }
        self.tags
            .insert(name.to_string(), values.iter().map(|v| v.to_string()).collect());
        Ok(())
    }

    fn name_matches(&self, name: &str) -> bool {
        let canonical = CanonicalName {
            text: name.to_string(),
            metric_len: name.find(' ').unwrap_or(name.len()),
        };
        for (key, allowed) in &self.tags {
            let found = canonical
                .tags()
                .find(|(k, _)| k == key)
                .map(|(_, v)| allowed.contains(v))
                .unwrap_or(false);
            if !found {
                return false;
            }
        }
        true
    }

    /// Matching ids, ordered by `(metric, tag-sorted canonical name)`. With no
    /// metric constraint and no tags, every id matches.
    pub fn extract_ids(&self, matcher: &SeriesMatcher) -> Result<Vec<SeriesId>, DbError> {
        let all = matcher.all_series()?;
        let mut out = Vec::new();
        if self.metrics.is_empty() {
            for (id, name) in &all {
                if self.name_matches(name) {
                    out.push(*id);
                }
            }
        } else {
            for metric in &self.metrics {
                for (id, name) in &all {
                    let name_metric = name.split(' ').next().unwrap_or("");
                    if name_metric == metric && self.name_matches(name) {
                        out.push(*id);
                    }
                }
            }
        }
        Ok(out)
    }
}

// --- Suggest --- //

/// Distinct metric names starting with `prefix`, as a throwaway matcher of
/// suggestion strings plus the matching ids.
pub fn suggest_metric_names(
    matcher: &SeriesMatcher,
    prefix: &str,
) -> Result<(PlainSeriesMatcher, Vec<SeriesId>), DbError> {
    let mut distinct = BTreeSet::new();
    for (_, name) in matcher.all_series()? {
        let metric = name.split(' ').next().unwrap_or("").to_string();
        if metric.starts_with(prefix) {
            distinct.insert(metric);
        }
    }
    Ok(build_suggestions(distinct))
}

/// Distinct tag keys used by `metric`, filtered by `prefix`.
pub fn suggest_tag_names(
    matcher: &SeriesMatcher,
    metric: &str,
    prefix: &str,
) -> Result<(PlainSeriesMatcher, Vec<SeriesId>), DbError> {
    let mut distinct = BTreeSet::new();
    for (_, name) in matcher.all_series()? {
        let mut parts = name.split(' ');
        if parts.next() != Some(metric) {
            continue;
        }
        for tok in parts {
            if let Some((key, _)) = tok.split_once('=') {
                if key.starts_with(prefix) {
                    distinct.insert(key.to_string());
                }
            }
        }
    }
    Ok(build_suggestions(distinct))
}

/// Distinct values of `tag` within `metric`, filtered by `prefix`.
pub fn suggest_tag_values(
    matcher: &SeriesMatcher,
    metric: &str,
    tag: &str,
    prefix: &str,
) -> Result<(PlainSeriesMatcher, Vec<SeriesId>), DbError> {
    let mut distinct = BTreeSet::new();
    for (_, name) in matcher.all_series()? {
        let mut parts = name.split(' ');
        if parts.next() != Some(metric) {
            continue;
        }
        for tok in parts {
            if let Some((key, value)) = tok.split_once('=') {
                if key == tag && value.starts_with(prefix) {
                    distinct.insert(value.to_string());
                }
            }
        }
    }
    Ok(build_suggestions(distinct))
}

fn build_suggestions(distinct: BTreeSet<String>) -> (PlainSeriesMatcher, Vec<SeriesId>) {
    let mut local = PlainSeriesMatcher::new(STARTING_SERIES_ID);
    let mut ids = Vec::with_capacity(distinct.len());
    for s in distinct {
        ids.push(local.add(&s));
    }
    (local, ids)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn canonical_form_sorts_tags() {
        let c = to_canonical_form("cpu.user  key=3   group=0").unwrap();
        assert_eq!(c.text, "cpu.user group=0 key=3");
        assert_eq!(c.metric(), "cpu.user");
        let tags: Vec<_> = c.tags().collect();
        assert_eq!(tags, vec![("group", "0"), ("key", "3")]);
    }

    #[test]
    fn canonical_form_rejects_bad_input() {
        assert!(matches!(to_canonical_form(""), Err(DbError::BadData(_))));
        assert!(matches!(to_canonical_form("metric"), Err(DbError::BadData(_))));
        assert!(matches!(
            to_canonical_form("metric novalue"),
            Err(DbError::BadData(_))
        ));
        assert!(matches!(
            to_canonical_form("metric a=1 a=2"),
            Err(DbError::BadData(_))
        ));
        let long_value = "v".repeat(MAX_SNAME);
        assert!(matches!(
            to_canonical_form(&format!("m a={}", long_value)),
            Err(DbError::BadData(_))
        ));
    }

    #[test]
    fn add_is_idempotent_and_ids_are_monotone() {
        let matcher = SeriesMatcher::default();
        let a = matcher.add("hello world=1").unwrap();
        let b = matcher.add("hello  world=1").unwrap();
        assert_eq!(a, b);
        assert_eq!(a, STARTING_SERIES_ID);
        let c = matcher.add("hello world=2").unwrap();
        assert!(c > a);
        assert_eq!(
            matcher.id2str(a).unwrap().unwrap().as_ref(),
            "hello world=1"
        );
    }

    #[test]
    fn match_name_does_not_register() {
        let matcher = SeriesMatcher::default();
        assert!(matcher.match_name("m a=1").unwrap().is_none());
        let id = matcher.add("m a=1").unwrap();
        assert_eq!(matcher.match_name("m a=1").unwrap(), Some(id));
    }

    #[test]
    fn event_names_get_the_event_bit() {
        let matcher = SeriesMatcher::default();
        let id = matcher.add("!app.log host=h1").unwrap();
        assert!(crate::types::is_event_id(id));
        assert_eq!(
            matcher.id2str(id).unwrap().unwrap().as_ref(),
            "!app.log host=h1"
        );
    }

    #[test]
    fn compound_name_yields_one_id_per_metric() {
        let matcher = SeriesMatcher::default();
        let ids = matcher
            .name_to_param_id_list("cpu.user|cpu.syst|cpu.idle host=h1")
            .unwrap();
        assert_eq!(ids.len(), 3);
        assert_eq!(
            matcher.id2str(ids[1]).unwrap().unwrap().as_ref(),
            "cpu.syst host=h1"
        );
    }

    #[test]
    fn pull_new_series_drains_incrementally() {
        let matcher = SeriesMatcher::default();
        matcher.add("m a=1").unwrap();
        matcher.add("m a=2").unwrap();
        assert_eq!(matcher.pull_new_series().unwrap().len(), 2);
        assert!(matcher.pull_new_series().unwrap().is_empty());
        matcher.add("m a=3").unwrap();
        // Re-adding an existing name is not a new series.
        matcher.add("m a=1").unwrap();
        assert_eq!(matcher.pull_new_series().unwrap().len(), 1);
    }

    #[test]
    fn regex_match_filters_names() {
        let matcher = SeriesMatcher::default();
        matcher.add("cpu.user host=a").unwrap();
        matcher.add("cpu.syst host=a").unwrap();
        matcher.add("mem.free host=a").unwrap();
        let hits = matcher.regex_match("^cpu\\.").unwrap();
        assert_eq!(hits.len(), 2);
    }

    #[test]
    fn retriever_duplicate_tag_is_bad_arg() {
        let mut r = SeriesRetriever::new();
        r.add_tag("host", "a").unwrap();
        assert!(matches!(r.add_tag("host", "b"), Err(DbError::BadArg(_))));
        assert!(matches!(r.add_tags("x", &[]), Err(DbError::BadArg(_))));
    }

    #[test]
    fn retriever_without_constraints_yields_all_ids() {
        let matcher = SeriesMatcher::default();
        for i in 0..5 {
            matcher.add(&format!("m key={}", i)).unwrap();
        }
        let ids = SeriesRetriever::new().extract_ids(&matcher).unwrap();
        assert_eq!(ids.len(), 5);
    }

    #[test]
    fn retriever_predicates_and_across_keys_or_within() {
        let matcher = SeriesMatcher::default();
        for key in 0..4 {
            for group in 0..2 {
                matcher
                    .add(&format!("test key={} group={}", key, group))
                    .unwrap();
            }
        }
        let mut r = SeriesRetriever::with_metrics(vec!["test".to_string()]);
        r.add_tags("key", &["1", "2"]).unwrap();
        r.add_tag("group", "0").unwrap();
        let ids = r.extract_ids(&matcher).unwrap();
        assert_eq!(ids.len(), 2);
        for id in ids {
            let name = matcher.id2str(id).unwrap().unwrap();
            assert!(name.contains("group=0"));
        }
    }

    #[test]
    fn retriever_multi_metric_union_in_metric_order() {
        let matcher = SeriesMatcher::default();
        matcher.add("b host=1").unwrap();
        matcher.add("a host=1").unwrap();
        let r = SeriesRetriever::with_metrics(vec!["b".to_string(), "a".to_string()]);
        let ids = r.extract_ids(&matcher).unwrap();
        let names: Vec<_> = ids
            .iter()
            .map(|&id| matcher.id2str(id).unwrap().unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["b host=1", "a host=1"]);
    }

    #[test]
    fn suggest_tag_values_returns_distinct_matches() {
        let matcher = SeriesMatcher::default();
        for value in ["bar", "baar", "bacr", "baer", "ba", "foo", "bart"] {
            matcher.add(&format!("m foo={}", value)).unwrap();
        }
        // Another tag with overlapping values must not leak in.
        matcher.add("m other=baz").unwrap();
        let (local, ids) = suggest_tag_values(&matcher, "m", "foo", "ba").unwrap();
        let mut values: Vec<String> = ids
            .iter()
            .map(|&id| local.id2str(id).unwrap().to_string())
            .collect();
        values.sort();
        assert_eq!(values, vec!["ba", "baar", "bacr", "baer", "bar", "bart"]);
    }

    #[test]
    fn suggest_metric_and_tag_names() {
        let matcher = SeriesMatcher::default();
        matcher.add("cpu.user host=a region=eu").unwrap();
        matcher.add("cpu.syst host=a").unwrap();
        matcher.add("mem.free host=a").unwrap();
        let (local, ids) = suggest_metric_names(&matcher, "cpu").unwrap();
        let metrics: Vec<String> = ids
            .iter()
            .map(|&id| local.id2str(id).unwrap().to_string())
            .collect();
        assert_eq!(metrics, vec!["cpu.syst", "cpu.user"]);

        let (local, ids) = suggest_tag_names(&matcher, "cpu.user", "r").unwrap();
        let names: Vec<String> = ids
            .iter()
            .map(|&id| local.id2str(id).unwrap().to_string())
            .collect();
        assert_eq!(names, vec!["region"]);
    }
}
