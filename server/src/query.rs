//! Compilation of user search parameters into index queries.
//!
//! Pure functions only: escaping, negation handling, time/bbox predicate
//! parsing and filter-query assembly. Everything that talks to the network
//! lives in [`crate::solr`].

use chrono::{Datelike, NaiveDate, NaiveDateTime};
use std::collections::BTreeMap;

use crate::flavour::Flavour;

/// Field names that identify a record; values of these keep their case.
pub const UNIQ_KEYS: [&str; 2] = ["file", "uri"];

/// Lucene special characters that need a leading backslash.
const ESCAPE_CHARS: [&str; 15] = [
    "+", "-", "&&", "||", "!", "(", ")", "{", "}", "[", "]", "^", "~", ":", "/",
];

/// Escape Lucene special characters in a query value.
pub fn escape(value: &str) -> String {
    let mut out = value.to_string();
    for special in ESCAPE_CHARS {
        if out.contains(special) {
            out = out.replace(special, &format!("\\{special}"));
        }
    }
    out
}

/// [`escape`] plus double-quote escaping, for values embedded in phrases.
pub fn escape_phrase(value: &str) -> String {
    escape(value).replace('"', "\\\"")
}

/// Split the values of one facet into positive and negative clauses.
///
/// A value negates with a leading `!` or `-`, a `not ` prefix (any case),
/// or when the facet name carries a `_not_` marker. Values of uniq keys
/// keep their case, everything else is lowercased.
pub fn partition_values(key: &str, values: &[String]) -> (Vec<String>, Vec<String>) {
    let mut positive = Vec::new();
    let mut negative = Vec::new();
    for value in values {
        let value = if UNIQ_KEYS.contains(&key) {
            value.clone()
        } else {
            value.to_lowercase()
        };
        if value.to_lowercase().starts_with("not ") {
            negative.push(value[4..].to_string());
        } else if value.starts_with('!') || value.starts_with('-') {
            negative.push(value[1..].to_string());
        } else if key.contains("_not_") {
            negative.push(value);
        } else {
            positive.push(value);
        }
    }
    (positive, negative)
}

/// Build the `key:(…)` / `-key:(…)` clause pair for one facet.
pub fn join_facet_queries(key: &str, values: &[String]) -> (String, String) {
    let (positive, negative) = partition_values(key, values);
    (escape(&positive.join(" OR ")), escape(&negative.join(" OR ")))
}

/// How a time or bbox predicate relates query and record extent.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Default)]
pub enum SelectMethod {
    /// Record extent contained in the query extent.
    Strict,
    /// Any overlap counts.
    #[default]
    Flexible,
    /// Query extent contained in one single record.
    File,
}

impl SelectMethod {
    pub fn parse(value: &str) -> Result<Self, String> {
        match value.to_lowercase().as_str() {
            "strict" => Ok(SelectMethod::Strict),
            "flexible" => Ok(SelectMethod::Flexible),
            "file" => Ok(SelectMethod::File),
            _ => Err("Choose from strict, flexible, file".to_string()),
        }
    }

    fn op(self) -> &'static str {
        match self {
            SelectMethod::Strict => "Within",
            SelectMethod::Flexible => "Intersects",
            SelectMethod::File => "Contains",
        }
    }
}

fn last_day_of_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 { (year + 1, 1) } else { (year, month + 1) };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|d| d.pred_opt())
        .map(|d| d.day())
        .unwrap_or(28)
}

/// Parse a partial ISO-8601 instant, filling missing components from the
/// side defaults: `0001-01-01T00:00:00` on the left, `9999-12-31T23:59:59`
/// on the right (day clamped to the month's length).
fn parse_partial(input: &str, end_side: bool) -> Result<NaiveDateTime, String> {
    let (def_year, def_month, def_hms) =
        if end_side { (9999, 12, (23, 59, 59)) } else { (1, 1, (0, 0, 0)) };
    if input.is_empty() {
        let day = if end_side { last_day_of_month(def_year, def_month) } else { 1 };
        return NaiveDate::from_ymd_opt(def_year, def_month, day)
            .and_then(|d| d.and_hms_opt(def_hms.0, def_hms.1, def_hms.2))
            .ok_or_else(|| "invalid default date".to_string());
    }
    let (date_part, time_part) = match input.split_once('t') {
        Some((d, t)) => (d, Some(t)),
        None => (input, None),
    };
    let mut date_fields = date_part.splitn(3, '-');
    let year: i32 = date_fields
        .next()
        .filter(|y| !y.is_empty())
        .and_then(|y| y.parse().ok())
        .ok_or_else(|| format!("could not parse date: {input}"))?;
    let month: u32 = match date_fields.next() {
        Some(m) => m.parse().map_err(|_| format!("could not parse date: {input}"))?,
        None => def_month,
    };
    let day: u32 = match date_fields.next() {
        Some(d) => d.parse().map_err(|_| format!("could not parse date: {input}"))?,
        None if end_side => last_day_of_month(year, month),
        None => 1,
    };
    let mut hms = [def_hms.0, def_hms.1, def_hms.2];
    if let Some(time_part) = time_part {
        for (slot, field) in hms.iter_mut().zip(time_part.splitn(3, ':')) {
            *slot = field.parse().map_err(|_| format!("could not parse time: {input}"))?;
        }
    }
    NaiveDate::from_ymd_opt(year, month, day)
        .and_then(|d| d.and_hms_opt(hms[0], hms[1], hms[2]))
        .ok_or_else(|| format!("date out of range: {input}"))
}

/// Compile the `time` search facet into a field-op filter query.
///
/// Accepts a single instant or `<start> to <end>` with either side
/// optional; instants may be partial (`2000`, `2000-02`, …).
pub fn adjust_time_string(time: &str, select: SelectMethod) -> Result<Option<String>, String> {
    let time: String = time.split_whitespace().collect();
    if time.is_empty() {
        return Ok(None);
    }
    let time = time.to_lowercase();
    let (start, end) = time.split_once("to").unwrap_or((time.as_str(), ""));
    let start = parse_partial(start, false)?;
    let end = parse_partial(end, true)?;
    Ok(Some(format!(
        "{{!field f=time op={}}}[{} TO {}]",
        select.op(),
        start.format("%Y-%m-%dT%H:%M:%S"),
        end.format("%Y-%m-%dT%H:%M:%S"),
    )))
}

/// Compile the `bbox` search facet (`min_lon,max_lon by min_lat,max_lat`)
/// into an envelope filter query.
pub fn adjust_bbox_string(bbox: &str, select: SelectMethod) -> Result<Option<String>, String> {
    let bbox: String = bbox.split_whitespace().collect();
    if bbox.is_empty() {
        return Ok(None);
    }
    let (lon_part, lat_part) = bbox
        .to_lowercase()
        .split_once("by")
        .map(|(a, b)| (a.to_string(), b.to_string()))
        .ok_or_else(|| format!("Failed to parse bbox string: {bbox}"))?;
    let parse_pair = |part: &str| -> Result<(f64, f64), String> {
        let (lo, hi) = part
            .split_once(',')
            .ok_or_else(|| format!("Failed to parse bbox string: {bbox}"))?;
        let lo: f64 = lo.parse().map_err(|_| format!("Failed to parse bbox string: {bbox}"))?;
        let hi: f64 = hi.parse().map_err(|_| format!("Failed to parse bbox string: {bbox}"))?;
        Ok((lo, hi))
    };
    let (min_lon, max_lon) = parse_pair(&lon_part)?;
    let (min_lat, max_lat) = parse_pair(&lat_part)?;
    if !((-180.0..=180.0).contains(&min_lon) && (-180.0..=180.0).contains(&max_lon)) {
        return Err("Longitude must be between -180 and 180".to_string());
    }
    if !((-90.0..=90.0).contains(&min_lat) && (-90.0..=90.0).contains(&max_lat)) {
        return Err("Latitude must be between -90 and 90".to_string());
    }
    if min_lon > max_lon || min_lat > max_lat {
        return Err("Bounding box minimum exceeds maximum".to_string());
    }
    Ok(Some(format!(
        "bbox:\"{}(ENVELOPE({min_lon},{max_lon},{max_lat},{min_lat}))\"",
        select.op()
    )))
}

/// Assemble the filter-query list for one search.
///
/// Order: time predicate, bbox predicate, user scope, AND-joined facet
/// clauses. The user scope keeps user-contributed records invisible outside
/// the `user` flavour.
pub fn filter_queries(
    facets: &BTreeMap<String, Vec<String>>,
    time_fq: Option<&str>,
    bbox_fq: Option<&str>,
    flavour: Flavour,
) -> Vec<String> {
    let mut clauses = Vec::new();
    for (key, values) in facets {
        let (positive, negative) = join_facet_queries(key, values);
        let key = key.to_lowercase().replace("_not_", "");
        if !positive.is_empty() {
            clauses.push(format!("{key}:({positive})"));
        }
        if !negative.is_empty() {
            clauses.push(format!("-{key}:({negative})"));
        }
    }
    let user_scope = if flavour == Flavour::User {
        "user:*"
    } else {
        "{!ex=userTag}-user:*"
    };
    let joined = if clauses.is_empty() {
        if time_fq.is_none() && bbox_fq.is_none() {
            Some("*:*".to_string())
        } else {
            None
        }
    } else {
        Some(clauses.join(" AND "))
    };
    [
        time_fq.map(str::to_string),
        bbox_fq.map(str::to_string),
        Some(user_scope.to_string()),
        joined,
    ]
    .into_iter()
    .flatten()
    .collect()
}

/// Decode a raw query string into ordered key/value pairs, keeping repeats.
pub fn parse_query_pairs(raw: Option<&str>) -> Vec<(String, String)> {
    url::form_urlencoded::parse(raw.unwrap_or("").as_bytes())
        .map(|(k, v)| (k.into_owned(), v.into_owned()))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_escape_adds_one_backslash_per_special() {
        assert_eq!(escape("cmip5"), "cmip5");
        assert_eq!(escape("a/b:c"), "a\\/b\\:c");
        assert_eq!(escape("x+y"), "x\\+y");
        assert_eq!(escape_phrase("say \"hi\""), "say \\\"hi\\\"");
    }

    #[test]
    fn test_negation_partition() {
        let (pos, neg) = partition_values(
            "experiment",
            &[
                "historical".to_string(),
                "!amip".to_string(),
                "-rcp85".to_string(),
                "Not piControl".to_string(),
            ],
        );
        assert_eq!(pos, vec!["historical"]);
        assert_eq!(neg, vec!["amip", "rcp85", "picontrol"]);
    }

    #[test]
    fn test_not_suffix_key_negates_everything() {
        let (pos, neg) = partition_values("model_not_", &["mpi-esm".to_string()]);
        assert!(pos.is_empty());
        assert_eq!(neg, vec!["mpi-esm"]);
    }

    #[test]
    fn test_uniq_key_values_keep_case() {
        let (pos, _) = partition_values("file", &["/Arch/TAS.nc".to_string()]);
        assert_eq!(pos, vec!["/Arch/TAS.nc"]);
    }

    #[test]
    fn test_time_defaults_fill_both_sides() {
        let fq = adjust_time_string("2000 to 2012", SelectMethod::Strict)
            .unwrap()
            .unwrap();
        assert_eq!(
            fq,
            "{!field f=time op=Within}[2000-01-01T00:00:00 TO 2012-12-31T23:59:59]"
        );
    }

    #[test]
    fn test_time_open_ended_range() {
        let fq = adjust_time_string("2000 to", SelectMethod::Flexible)
            .unwrap()
            .unwrap();
        assert!(fq.contains("op=Intersects"));
        assert!(fq.ends_with("TO 9999-12-31T23:59:59]"));
    }

    #[test]
    fn test_time_partial_month_clamps_end_day() {
        let fq = adjust_time_string("2004-02 to 2012-02", SelectMethod::File)
            .unwrap()
            .unwrap();
        assert!(fq.contains("op=Contains"));
        assert!(fq.contains("2004-02-01T00:00:00 TO 2012-02-29T23:59:59"));
    }

    #[test]
    fn test_time_garbage_fails() {
        assert!(adjust_time_string("down to earth", SelectMethod::Flexible).is_err());
    }

    #[test]
    fn test_bbox_envelope_form() {
        let fq = adjust_bbox_string("-10,10 by -10,10", SelectMethod::Flexible)
            .unwrap()
            .unwrap();
        assert_eq!(fq, "bbox:\"Intersects(ENVELOPE(-10,10,10,-10))\"");
    }

    #[test]
    fn test_bbox_out_of_range() {
        assert!(adjust_bbox_string("-190,10 by 0,10", SelectMethod::Strict).is_err());
        assert!(adjust_bbox_string("0,10 by 95,99", SelectMethod::Strict).is_err());
        assert!(adjust_bbox_string("10,0 by 0,10", SelectMethod::Strict).is_err());
    }

    #[test]
    fn test_filter_queries_user_scope() {
        let facets: BTreeMap<String, Vec<String>> =
            [("project".to_string(), vec!["cmip5".to_string()])].into();
        let fq = filter_queries(&facets, None, None, Flavour::Freva);
        assert!(fq.contains(&"{!ex=userTag}-user:*".to_string()));
        assert!(fq.contains(&"project:(cmip5)".to_string()));

        let fq = filter_queries(&facets, None, None, Flavour::User);
        assert!(fq.contains(&"user:*".to_string()));
    }

    #[test]
    fn test_filter_queries_match_all_without_facets() {
        let fq = filter_queries(&BTreeMap::new(), None, None, Flavour::Freva);
        assert!(fq.contains(&"*:*".to_string()));
        let fq = filter_queries(&BTreeMap::new(), Some("time-fq"), None, Flavour::Freva);
        assert!(!fq.contains(&"*:*".to_string()));
        assert!(fq.contains(&"time-fq".to_string()));
    }

    #[test]
    fn test_parse_query_pairs_keeps_repeats() {
        let pairs = parse_query_pairs(Some("variable=tas&variable=pr&project=cmip5"));
        assert_eq!(pairs.len(), 3);
        assert_eq!(pairs[0], ("variable".to_string(), "tas".to_string()));
    }
}
