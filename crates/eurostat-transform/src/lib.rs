//! # eurostat-transform
//!
//! Turns parsed TSV chunks into long-form `Observation`s: unpivot,
//! value/flag split, and optional code-to-label substitution
//! (spec.md §4.3).

use eurostat_core::model::{CodelistMap, Dsd, Observation, Representation};
use eurostat_parse::RowChunk;
use regex::Regex;
use std::sync::OnceLock;
use tracing::warn;

/// Token grammar: an optional numeric literal, then optional flag
/// letters/spaces. Either group may be empty.
fn token_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"^\s*(-?[0-9.eE+-]+)?\s*([A-Za-z ]*)\s*$").unwrap())
}

/// Unpivots parsed TSV chunks into a finite sequence of `Observation`s.
///
/// One candidate record is emitted per (data row, time-period column),
/// so `rows_loaded` for a fully transformed dataset equals dimension
/// combinations times time periods, independent of how many cells
/// happened to carry a value.
pub struct Transformer<'a> {
    dsd: &'a Dsd,
    codelists: &'a CodelistMap,
    representation: Representation,
}

impl<'a> Transformer<'a> {
    pub fn new(dsd: &'a Dsd, codelists: &'a CodelistMap, representation: Representation) -> Self {
        Transformer {
            dsd,
            codelists,
            representation,
        }
    }

    /// Transform one chunk into its `Observation`s, in row-then-time-period
    /// order. The dimension column order on each `Observation` always
    /// follows `dsd.non_time_dimension_ids()`, not the chunk's own header
    /// order, so a chunk whose columns were declared out of order still
    /// produces DSD-ordered output.
    pub fn transform_chunk(&self, chunk: &RowChunk) -> Vec<Observation> {
        let dsd_order = self.dsd.non_time_dimension_ids();
        let mut col_index = Vec::with_capacity(dsd_order.len());
        for dim_id in &dsd_order {
            match chunk.dimension_ids.iter().position(|c| c == dim_id) {
                Some(idx) => col_index.push(idx),
                None => {
                    warn!(dimension = %dim_id, "dsd dimension absent from tsv header, skipping chunk");
                    return Vec::new();
                }
            }
        }

        let mut out = Vec::with_capacity(chunk.rows.len() * chunk.time_periods.len());
        for row in &chunk.rows {
            let dim_values: Vec<(String, String)> = dsd_order
                .iter()
                .zip(&col_index)
                .map(|(dim_id, &idx)| {
                    let raw = row
                        .dimension_values
                        .get(idx)
                        .map(|s| s.as_str())
                        .unwrap_or("");
                    let value = self.represent(dim_id, raw);
                    (dim_id.to_string(), value)
                })
                .collect();

            for (time_period, token) in chunk.time_periods.iter().zip(&row.raw_tokens) {
                let (obs_value, obs_flags) = split_value_flags(token);
                out.push(Observation {
                    dimensions: dim_values.clone(),
                    time_period: time_period.clone(),
                    obs_value,
                    obs_flags,
                });
            }
        }
        out
    }

    fn represent(&self, dim_id: &str, code: &str) -> String {
        if self.representation == Representation::Standard {
            return code.to_string();
        }
        let dimension = self.dsd.dimensions().iter().find(|d| d.id == dim_id);
        let Some(codelist_id) = dimension.and_then(|d| d.codelist_id.as_ref()) else {
            return code.to_string();
        };
        self.codelists
            .get(codelist_id)
            .and_then(|cl| cl.label_for(code))
            .map(|label| label.to_string())
            .unwrap_or_else(|| code.to_string())
    }
}

/// Split one raw observation token into `(value, flags)` per the token
/// grammar. `:` always yields a null value; a lone `-` or `.` is
/// classified as an invalid value and yields null with no flag rather
/// than being treated as a flag string.
fn split_value_flags(token: &str) -> (Option<f64>, Option<String>) {
    let trimmed = token.trim();
    if trimmed.is_empty() {
        return (None, None);
    }
    if trimmed == ":" {
        return (None, None);
    }
    if trimmed == "-" || trimmed == "." {
        return (None, None);
    }

    let Some(caps) = token_regex().captures(trimmed) else {
        let flags_only = trimmed.strip_prefix(':').unwrap_or(trimmed);
        return (None, Some(collapse_flags(flags_only)).filter(|s| !s.is_empty()));
    };

    let numeric_part = caps.get(1).map(|m| m.as_str()).unwrap_or("");
    let flag_part = caps.get(2).map(|m| m.as_str()).unwrap_or("");
    let flags = collapse_flags(flag_part);
    let flags = if flags.is_empty() { None } else { Some(flags) };

    if numeric_part.is_empty() {
        return (None, flags.or_else(|| Some(collapse_flags(trimmed)).filter(|s| !s.is_empty())));
    }

    match numeric_part.parse::<f64>() {
        Ok(v) if v.is_finite() => (Some(v), flags),
        _ => (None, Some(token.trim().to_string())),
    }
}

fn collapse_flags(raw: &str) -> String {
    raw.split_whitespace().collect::<Vec<_>>().join(" ")
}

#[cfg(test)]
mod tests {
    use super::*;
    use eurostat_core::model::{CodeEntry, Codelist, Dimension};
    use eurostat_parse::WideRow;

    fn s1_dsd_and_codelists() -> (Dsd, CodelistMap) {
        let mut codelists = CodelistMap::new();
        let mut geo = Codelist::new("geo");
        geo.insert(
            "DE",
            CodeEntry {
                label: "Germany".into(),
                description: None,
                parent_code: None,
            },
        )
        .unwrap();
        geo.insert(
            "FR",
            CodeEntry {
                label: "France".into(),
                description: None,
                parent_code: None,
            },
        )
        .unwrap();
        codelists.insert("geo".to_string(), geo);

        let mut freq = Codelist::new("freq");
        freq.insert(
            "A",
            CodeEntry {
                label: "Annual".into(),
                description: None,
                parent_code: None,
            },
        )
        .unwrap();
        codelists.insert("freq".to_string(), freq);

        let dsd = Dsd::new(
            "nama_10_gdp",
            "1.0",
            vec![
                Dimension {
                    id: "geo".into(),
                    codelist_id: Some("geo".into()),
                },
                Dimension {
                    id: "freq".into(),
                    codelist_id: Some("freq".into()),
                },
            ],
            vec![],
            None,
            "time",
            &codelists,
        )
        .unwrap();

        (dsd, codelists)
    }

    fn s1_chunk() -> RowChunk {
        RowChunk {
            dimension_ids: vec!["geo".into(), "freq".into()],
            time_periods: vec!["2020".into(), "2021".into()],
            rows: vec![
                WideRow {
                    dimension_values: vec!["DE".into(), "A".into()],
                    raw_tokens: vec!["10.5".into(), "11 p".into()],
                },
                WideRow {
                    dimension_values: vec!["FR".into(), "A".into()],
                    raw_tokens: vec![":".into(), "9".into()],
                },
            ],
        }
    }

    #[test]
    fn s1_small_full_load_standard_representation() {
        let (dsd, codelists) = s1_dsd_and_codelists();
        let chunk = s1_chunk();
        let t = Transformer::new(&dsd, &codelists, Representation::Standard);
        let obs = t.transform_chunk(&chunk);

        assert_eq!(obs.len(), 4);

        assert_eq!(obs[0].dimension("geo"), Some("DE"));
        assert_eq!(obs[0].dimension("freq"), Some("A"));
        assert_eq!(obs[0].time_period, "2020");
        assert_eq!(obs[0].obs_value, Some(10.5));
        assert_eq!(obs[0].obs_flags, None);

        assert_eq!(obs[1].time_period, "2021");
        assert_eq!(obs[1].obs_value, Some(11.0));
        assert_eq!(obs[1].obs_flags.as_deref(), Some("p"));

        assert_eq!(obs[2].dimension("geo"), Some("FR"));
        assert_eq!(obs[2].time_period, "2020");
        assert_eq!(obs[2].obs_value, None);
        assert_eq!(obs[2].obs_flags, None);

        assert_eq!(obs[3].time_period, "2021");
        assert_eq!(obs[3].obs_value, Some(9.0));
        assert_eq!(obs[3].obs_flags, None);
    }

    #[test]
    fn s2_full_representation_substitutes_labels() {
        let (dsd, codelists) = s1_dsd_and_codelists();
        let chunk = s1_chunk();
        let t = Transformer::new(&dsd, &codelists, Representation::Full);
        let obs = t.transform_chunk(&chunk);

        assert_eq!(obs[0].dimension("geo"), Some("Germany"));
        assert_eq!(obs[0].dimension("freq"), Some("Annual"));
        assert_eq!(obs[2].dimension("geo"), Some("France"));
        assert_eq!(obs[2].dimension("freq"), Some("Annual"));
    }

    #[test]
    fn full_representation_passes_through_unresolved_code() {
        let (dsd, codelists) = s1_dsd_and_codelists();
        let mut chunk = s1_chunk();
        chunk.rows[0].dimension_values[0] = "XX".to_string();
        let t = Transformer::new(&dsd, &codelists, Representation::Full);
        let obs = t.transform_chunk(&chunk);
        assert_eq!(obs[0].dimension("geo"), Some("XX"));
    }

    #[test]
    fn splits_plain_number() {
        assert_eq!(split_value_flags("10.5"), (Some(10.5), None));
    }

    #[test]
    fn splits_number_and_flag() {
        let (v, f) = split_value_flags("11 p");
        assert_eq!(v, Some(11.0));
        assert_eq!(f.as_deref(), Some("p"));
    }

    #[test]
    fn splits_lone_flag_string() {
        let (v, f) = split_value_flags("u");
        assert_eq!(v, None);
        assert_eq!(f.as_deref(), Some("u"));
    }

    #[test]
    fn colon_means_not_available() {
        assert_eq!(split_value_flags(":"), (None, None));
    }

    #[test]
    fn colon_with_trailing_flag_strips_the_colon() {
        assert_eq!(split_value_flags(":c"), (None, Some("c".to_string())));
    }

    #[test]
    fn collapses_internal_whitespace_in_flags() {
        let (_, f) = split_value_flags("42   p  e");
        assert_eq!(f.as_deref(), Some("p e"));
    }

    #[test]
    fn lone_dash_or_dot_is_invalid_value_not_flag() {
        assert_eq!(split_value_flags("-"), (None, None));
        assert_eq!(split_value_flags("."), (None, None));
    }
}
