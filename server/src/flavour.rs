//! Facet-name translation between metadata naming conventions.
//!
//! The catalog speaks one canonical vocabulary (the `freva` flavour); every
//! other flavour is a bijective renaming of a subset of it. Translation is
//! opt-in per request so clients may do the renaming themselves.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// The naming conventions the databrowser understands.
#[derive(Clone, Copy, Debug, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Flavour {
    Freva,
    Cmip6,
    Cmip5,
    Cordex,
    Nextgems,
    User,
}

/// All flavours in presentation order.
pub const FLAVOURS: [Flavour; 6] = [
    Flavour::Freva,
    Flavour::Cmip6,
    Flavour::Cmip5,
    Flavour::Cordex,
    Flavour::Nextgems,
    Flavour::User,
];

impl Flavour {
    pub fn as_str(self) -> &'static str {
        match self {
            Flavour::Freva => "freva",
            Flavour::Cmip6 => "cmip6",
            Flavour::Cmip5 => "cmip5",
            Flavour::Cordex => "cordex",
            Flavour::Nextgems => "nextgems",
            Flavour::User => "user",
        }
    }
}

impl fmt::Display for Flavour {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Flavour {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "freva" => Ok(Flavour::Freva),
            "cmip6" => Ok(Flavour::Cmip6),
            "cmip5" => Ok(Flavour::Cmip5),
            "cordex" => Ok(Flavour::Cordex),
            "nextgems" => Ok(Flavour::Nextgems),
            "user" => Ok(Flavour::User),
            other => Err(format!("unknown flavour: {other}")),
        }
    }
}

/// Canonical facets and whether they show up in default facet listings.
const CANONICAL_FACETS: [(&str, bool); 23] = [
    ("project", true),
    ("product", true),
    ("institute", true),
    ("model", true),
    ("experiment", true),
    ("time_frequency", true),
    ("realm", true),
    ("variable", true),
    ("ensemble", true),
    ("time_aggregation", true),
    ("fs_type", false),
    ("grid_label", false),
    ("cmor_table", false),
    ("driving_model", false),
    ("format", false),
    ("grid_id", false),
    ("level_type", false),
    ("rcm_name", false),
    ("rcm_version", false),
    ("dataset", false),
    ("time", false),
    ("bbox", false),
    ("user", false),
];

/// Facets that make a cordex dataset, always primary under that flavour.
pub const CORDEX_KEYS: [&str; 3] = ["rcm_name", "driving_model", "rcm_version"];

/// Hierarchy of facets that define a dataset; drives the intake header and
/// the order of catalog row fields.
pub const FACET_HIERARCHY: [&str; 14] = [
    "project",
    "product",
    "institute",
    "model",
    "experiment",
    "time_frequency",
    "realm",
    "variable",
    "ensemble",
    "cmor_table",
    "fs_type",
    "grid_label",
    "grid_id",
    "format",
];

/// Whether a canonical facet is part of a flavour's vocabulary.
///
/// The `user` facet marks user-contributed records and only exists in the
/// canonical vocabularies; the translated flavours do not expose it.
fn in_flavour(flavour: Flavour, canonical: &str) -> bool {
    canonical != "user" || matches!(flavour, Flavour::Freva | Flavour::User)
}

/// Flavour-specific name of a canonical facet.
fn forward_name(flavour: Flavour, canonical: &str) -> &'static str {
    let translated = match flavour {
        Flavour::Freva | Flavour::User => None,
        Flavour::Cmip5 => match canonical {
            "ensemble" => Some("member_id"),
            "institute" => Some("institution_id"),
            "model" => Some("model_id"),
            _ => None,
        },
        Flavour::Cmip6 => match canonical {
            "experiment" => Some("experiment_id"),
            "ensemble" => Some("member_id"),
            "institute" => Some("institution_id"),
            "model" => Some("source_id"),
            "project" => Some("mip_era"),
            "product" => Some("activity_id"),
            "variable" => Some("variable_id"),
            "time_frequency" => Some("frequency"),
            "cmor_table" => Some("table_id"),
            _ => None,
        },
        Flavour::Cordex => match canonical {
            "institute" => Some("institution"),
            "product" => Some("domain"),
            _ => None,
        },
        Flavour::Nextgems => match canonical {
            "ensemble" => Some("member_id"),
            "institute" => Some("institution_id"),
            "model" => Some("source_id"),
            "product" => Some("experiment_id"),
            "variable" => Some("variable_id"),
            "time_aggregation" => Some("time_reduction"),
            _ => None,
        },
    };
    translated.unwrap_or_else(|| {
        CANONICAL_FACETS
            .iter()
            .map(|(name, _)| *name)
            .find(|name| *name == canonical)
            .unwrap_or("")
    })
}

/// Bidirectional facet-name mapping for one flavour.
#[derive(Clone, Copy, Debug)]
pub struct Translator {
    pub flavour: Flavour,
    pub translate: bool,
}

impl Translator {
    pub fn new(flavour: Flavour, translate: bool) -> Self {
        Self { flavour, translate }
    }

    /// Canonical name → flavour name, identity when translation is off.
    pub fn forward_lookup(&self) -> BTreeMap<&'static str, &'static str> {
        CANONICAL_FACETS
            .iter()
            .filter(|(name, _)| in_flavour(self.flavour, name))
            .map(|(name, _)| (*name, forward_name(self.flavour, name)))
            .collect()
    }

    /// Flavour name → canonical name.
    pub fn backward_lookup(&self) -> BTreeMap<&'static str, &'static str> {
        self.forward_lookup().into_iter().map(|(k, v)| (v, k)).collect()
    }

    /// Flavour names of the flavour's facets, in canonical declaration
    /// order.
    pub fn ordered_facets(&self) -> Vec<&'static str> {
        CANONICAL_FACETS
            .iter()
            .filter(|(name, _)| in_flavour(self.flavour, name))
            .map(|(name, _)| forward_name(self.flavour, name))
            .collect()
    }

    /// Names accepted as query parameters for this flavour.
    pub fn valid_facets(&self) -> Vec<&'static str> {
        if self.translate {
            self.forward_lookup().into_values().collect()
        } else {
            CANONICAL_FACETS
                .iter()
                .filter(|(name, _)| in_flavour(self.flavour, name))
                .map(|(name, _)| *name)
                .collect()
        }
    }

    /// Facets shown in default listings, mapped through the flavour.
    /// Cordex additionally surfaces the keys that make a cordex dataset.
    pub fn primary_keys(&self) -> Vec<String> {
        let mut keys: Vec<String> = CANONICAL_FACETS
            .iter()
            .filter(|(_, primary)| *primary)
            .map(|(name, _)| {
                if self.translate {
                    forward_name(self.flavour, name).to_string()
                } else {
                    name.to_string()
                }
            })
            .collect();
        if self.flavour == Flavour::Cordex {
            keys.extend(CORDEX_KEYS.iter().map(|k| k.to_string()));
        }
        keys
    }

    /// Translate one facet name; unknown names pass through unchanged.
    pub fn translate_facet(&self, name: &str, backwards: bool) -> String {
        if !self.translate {
            return name.to_string();
        }
        let table = if backwards { self.backward_lookup() } else { self.forward_lookup() };
        table.get(name).map(|s| s.to_string()).unwrap_or_else(|| name.to_string())
    }

    /// Rename the keys of a query map.
    pub fn translate_query<V>(
        &self,
        query: BTreeMap<String, V>,
        backwards: bool,
    ) -> BTreeMap<String, V> {
        query
            .into_iter()
            .map(|(k, v)| (self.translate_facet(&k, backwards), v))
            .collect()
    }

    /// Facet-name mapping reported back to clients, restricted to `fields`.
    pub fn facet_mapping(&self, fields: &[String]) -> BTreeMap<String, String> {
        let forward = self.forward_lookup();
        fields
            .iter()
            .filter_map(|f| {
                forward
                    .get(f.as_str())
                    .map(|mapped| (f.clone(), mapped.to_string()))
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_roundtrip_every_flavour() {
        for flavour in FLAVOURS {
            let translator = Translator::new(flavour, true);
            let backward = translator.backward_lookup();
            for (canonical, mapped) in translator.forward_lookup() {
                assert_eq!(backward[mapped], canonical, "{flavour}: {canonical}");
            }
        }
    }

    #[test]
    fn test_cmip6_table() {
        let translator = Translator::new(Flavour::Cmip6, true);
        let forward = translator.forward_lookup();
        assert_eq!(forward["experiment"], "experiment_id");
        assert_eq!(forward["project"], "mip_era");
        assert_eq!(forward["time_frequency"], "frequency");
        assert_eq!(forward["realm"], "realm");
    }

    #[test]
    fn test_translation_disabled_is_identity() {
        let translator = Translator::new(Flavour::Cmip6, false);
        assert_eq!(translator.translate_facet("experiment", false), "experiment");
        assert!(translator.valid_facets().contains(&"experiment"));
    }

    #[test]
    fn test_user_facet_only_in_canonical_vocabularies() {
        for flavour in [Flavour::Freva, Flavour::User] {
            let translator = Translator::new(flavour, true);
            assert!(translator.forward_lookup().contains_key("user"), "{flavour}");
            assert!(translator.valid_facets().contains(&"user"), "{flavour}");
        }
        for flavour in [Flavour::Cmip5, Flavour::Cmip6, Flavour::Cordex, Flavour::Nextgems] {
            let translator = Translator::new(flavour, true);
            assert!(!translator.forward_lookup().contains_key("user"), "{flavour}");
            assert!(!translator.ordered_facets().contains(&"user"), "{flavour}");
            assert!(!translator.valid_facets().contains(&"user"), "{flavour}");
            let untranslated = Translator::new(flavour, false);
            assert!(!untranslated.valid_facets().contains(&"user"), "{flavour}");
        }
    }

    #[test]
    fn test_cordex_primary_keys_include_rcm_facets() {
        let keys = Translator::new(Flavour::Cordex, true).primary_keys();
        for key in CORDEX_KEYS {
            assert!(keys.contains(&key.to_string()), "missing {key}");
        }
        let freva = Translator::new(Flavour::Freva, true).primary_keys();
        assert!(!freva.contains(&"rcm_name".to_string()));
    }

    #[test]
    fn test_translate_query_backwards() {
        let translator = Translator::new(Flavour::Cmip6, true);
        let query: BTreeMap<String, Vec<String>> =
            [("experiment_id".to_string(), vec!["amip".to_string()])].into();
        let canonical = translator.translate_query(query, true);
        assert!(canonical.contains_key("experiment"));
    }
}
