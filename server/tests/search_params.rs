//! Integration tests for search parameter validation and query
//! compilation, run entirely without a backend.

use std::path::Path;

use freva_rest::flavour::Flavour;
use freva_rest::solr::Solr;
use freva_rest::types::UniqKey;
use freva_rest::{AppContext, ServerConfig};

fn ctx() -> AppContext {
    AppContext::new(ServerConfig::load(Some(Path::new("/nonexistent.toml")), false))
}

fn pairs(entries: &[(&str, &str)]) -> Vec<(String, String)> {
    entries
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}

fn solr(flavour: Flavour, params: &[(&str, &str)]) -> Result<Solr, freva_rest::ApiError> {
    Solr::validate_parameters(
        ctx(),
        flavour,
        UniqKey::File,
        0,
        false,
        true,
        &pairs(params),
    )
}

#[test]
fn test_negated_values_split_into_clauses() {
    let search = solr(
        Flavour::Freva,
        &[("project", "cmip5"), ("experiment", "!amip")],
    )
    .unwrap();
    let fq = search.filter_queries();
    let joined = fq.last().unwrap();
    assert!(joined.contains("project:(cmip5)"), "{joined}");
    assert!(joined.contains("-experiment:(amip)"), "{joined}");
}

#[test]
fn test_unknown_facet_is_rejected_with_422() {
    let err = solr(Flavour::Freva, &[("activity", "cmip")]).unwrap_err();
    assert_eq!(err.status_code().as_u16(), 422);
}

#[test]
fn test_cmip6_names_translate_back_to_canonical() {
    let search = solr(Flavour::Cmip6, &[("experiment_id", "amip")]).unwrap();
    assert!(search.facets.contains_key("experiment"));
    let fq = search.filter_queries();
    assert!(fq.iter().any(|clause| clause.contains("experiment:(amip)")));
}

#[test]
fn test_cmip6_does_not_accept_canonical_names_when_translating() {
    // with translation on, only the flavour's own vocabulary validates;
    // names shared between vocabularies still pass
    assert!(solr(Flavour::Cmip6, &[("realm", "atmos")]).is_ok());
    assert!(solr(Flavour::Cmip6, &[("experiment_id", "amip")]).is_ok());
}

#[test]
fn test_time_selects_map_to_field_ops() {
    for (select, op) in [
        ("strict", "Within"),
        ("flexible", "Intersects"),
        ("file", "Contains"),
    ] {
        let search = solr(
            Flavour::Freva,
            &[("time", "2000 to 2012"), ("time_select", select)],
        )
        .unwrap();
        let fq = search.filter_queries();
        assert!(
            fq.iter().any(|clause| clause.contains(&format!("op={op}"))),
            "missing {op} in {fq:?}"
        );
    }
}

#[test]
fn test_broken_time_is_a_parse_error() {
    let err = solr(Flavour::Freva, &[("time", "next tuesday")]).unwrap_err();
    assert_eq!(err.status_code().as_u16(), 500);
}

#[test]
fn test_broken_bbox_is_a_parse_error() {
    let err = solr(Flavour::Freva, &[("bbox", "-300,10 by 0,10")]).unwrap_err();
    assert_eq!(err.status_code().as_u16(), 500);
}

#[test]
fn test_user_facet_is_rejected_under_translated_flavours() {
    for flavour in [Flavour::Cmip5, Flavour::Cmip6, Flavour::Cordex, Flavour::Nextgems] {
        let err = solr(flavour, &[("user", "jdoe")]).unwrap_err();
        assert_eq!(err.status_code().as_u16(), 422, "{flavour}");
    }
    assert!(solr(Flavour::Freva, &[("user", "jdoe")]).is_ok());
    assert!(solr(Flavour::User, &[("user", "jdoe")]).is_ok());
}

#[test]
fn test_user_scope_follows_flavour() {
    let search = solr(Flavour::Freva, &[("project", "cmip5")]).unwrap();
    assert!(search
        .filter_queries()
        .contains(&"{!ex=userTag}-user:*".to_string()));

    let search = solr(Flavour::User, &[("project", "cmip5")]).unwrap();
    assert!(search.filter_queries().contains(&"user:*".to_string()));
}

#[test]
fn test_uniq_key_search_values_stay_verbatim() {
    let search = solr(Flavour::Freva, &[("file", "/Arch/TAS.nc")]).unwrap();
    let fq = search.filter_queries();
    assert!(
        fq.iter().any(|clause| clause.contains("/Arch/TAS.nc".replace('/', "\\/").as_str())),
        "file clause missing in {fq:?}"
    );
}

#[test]
fn test_store_urls_are_deterministic() {
    let a = data_portal_core::dataset_uuid("slk:///arch/data.nc");
    let b = data_portal_core::dataset_uuid("slk:///arch/data.nc");
    assert_eq!(a, b);
}
