//! Safe dataset/staging table naming and identifier quoting.
//!
//! Dataset ids are treated as opaque identifiers coming from an
//! external inventory; this module is the single place that turns
//! them into SQL object names, so it is the single place an injection
//! bug could live. Every adapter goes through it rather than
//! interpolating dataset ids directly.

const MAX_IDENT_LEN: usize = 63; // PostgreSQL's NAMEDATALEN - 1

/// Lowercase, underscore-only, length-capped rendering of an arbitrary
/// dataset id, safe to use as (part of) a SQL identifier.
pub fn safe_ident(raw: &str) -> String {
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch.is_ascii_alphanumeric() {
            out.push(ch.to_ascii_lowercase());
        } else {
            out.push('_');
        }
    }
    if out.is_empty() || !out.chars().next().unwrap().is_ascii_alphabetic() {
        out.insert_str(0, "t_");
    }
    out.truncate(MAX_IDENT_LEN);
    out
}

/// The data table name for a dataset id, e.g. `data_nama_10_gdp`.
pub fn data_table_name(dataset_id: &str) -> String {
    format!("data_{}", safe_ident(dataset_id))
}

/// The metadata table name for a code list id, e.g. `cl_geo`.
pub fn codelist_table_name(codelist_id: &str) -> String {
    format!("cl_{}", safe_ident(codelist_id))
}

/// A run-scoped staging table name: the target name plus a run-id
/// suffix, so abandoned staging tables are identifiable and drop-safe
/// (spec.md §6).
pub fn staging_table_name(target: &str, run_id: &str) -> String {
    format!("{target}__staging_{}", safe_ident(run_id))
}

/// Quote a (already-safe) identifier for inclusion in a SQL statement,
/// doubling embedded quotes defensively even though `safe_ident`
/// output never contains one.
pub fn quote_ident(ident: &str) -> String {
    format!("\"{}\"", ident.replace('"', "\"\""))
}

/// Quote a schema-qualified name: `schema.table`.
pub fn quote_qualified(schema: &str, table: &str) -> String {
    format!("{}.{}", quote_ident(schema), quote_ident(table))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn safe_ident_lowercases_and_replaces_punctuation() {
        assert_eq!(safe_ident("NAMA_10-GDP"), "nama_10_gdp");
    }

    #[test]
    fn safe_ident_rejects_sql_metacharacters() {
        let ident = safe_ident("robert'); DROP TABLE students;--");
        assert!(!ident.contains('\''));
        assert!(!ident.contains(';'));
        assert!(!ident.contains(' '));
    }

    #[test]
    fn safe_ident_prefixes_non_alpha_start() {
        assert_eq!(safe_ident("10_gdp"), "t_10_gdp");
    }

    #[test]
    fn safe_ident_truncates_long_ids() {
        let long = "a".repeat(200);
        assert_eq!(safe_ident(&long).len(), MAX_IDENT_LEN);
    }

    #[test]
    fn quote_ident_doubles_embedded_quotes() {
        assert_eq!(quote_ident("weird\"name"), "\"weird\"\"name\"");
    }

    #[test]
    fn staging_table_name_is_deterministic_per_run() {
        let a = staging_table_name("data_nama_10_gdp", "20240601T000000Z");
        let b = staging_table_name("data_nama_10_gdp", "20240601T000000Z");
        assert_eq!(a, b);
        assert!(a.starts_with("data_nama_10_gdp__staging_"));
    }
}
