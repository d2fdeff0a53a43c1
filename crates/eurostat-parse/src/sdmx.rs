//! `SdmxParser`: parses an SDMX-ML structure document into a `Dsd` and
//! its accompanying `Codelist`s (spec.md §4.2).
//!
//! SDMX-ML elements are namespaced (`structure:`, `message:`, ...); this
//! parser matches on the local name (the part after the last `:`) so it
//! is agnostic to the namespace prefixes a given Eurostat export uses.
//! It consumes `CodeList`/`Code`, `Dimension`/`TimeDimension`/
//! `Attribute`/`PrimaryMeasure` elements in document order, which the
//! rest of the pipeline relies on as column order.

use std::io::BufRead;

use eurostat_core::error::PipelineError;
use eurostat_core::model::{Attribute, CodeEntry, Codelist, CodelistMap, Dimension, Dsd};
use quick_xml::events::Event;
use quick_xml::reader::Reader;
use tracing::warn;

pub struct SdmxParser;

/// The parsed structure document: the DSD plus every code list it (or
/// a sibling document) declared.
pub struct ParsedStructure {
    pub dsd: Dsd,
    pub codelists: CodelistMap,
}

impl SdmxParser {
    /// Parse a single SDMX-ML document containing both `CodeLists` and
    /// a `KeyFamily`/`DataStructure` describing dimensions, attributes,
    /// the time dimension and the primary measure.
    pub fn parse<R: BufRead>(reader: R) -> Result<ParsedStructure, PipelineError> {
        let mut xml = Reader::from_reader(reader);
        xml.config_mut().trim_text = true;

        let mut codelists = CodelistMap::new();
        let mut dimensions: Vec<Dimension> = Vec::new();
        let mut attributes: Vec<Attribute> = Vec::new();
        let mut time_dimension: Option<String> = None;
        let mut primary_measure: Option<String> = None;
        let mut dataset_id = String::new();
        let mut version = "1.0".to_string();

        // Code-list scan state.
        let mut current_codelist: Option<Codelist> = None;
        let mut current_code: Option<String> = None;
        let mut current_parent: Option<String> = None;
        let mut in_description = false;
        let mut description_buf = String::new();

        let mut buf = Vec::new();
        loop {
            match xml.read_event_into(&mut buf).map_err(|e| PipelineError::DsdInvalid {
                dataset_id: dataset_id.clone(),
                reason: format!("XML error: {e}"),
            })? {
                Event::Start(e) => {
                    let name = local_name(&e);

                    match name.as_str() {
                        "KeyFamily" | "DataStructure" => {
                            if let Some(id) = attr(&e, "id") {
                                dataset_id = id;
                            }
                            if let Some(v) = attr(&e, "version") {
                                version = v;
                            }
                        }
                        "CodeList" => {
                            let id = attr(&e, "id").unwrap_or_default();
                            current_codelist = Some(Codelist::new(id));
                        }
                        "Code" => {
                            current_code = attr(&e, "value").or_else(|| attr(&e, "id"));
                            current_parent = attr(&e, "parentCode");
                        }
                        "Description" => {
                            in_description = true;
                            description_buf.clear();
                        }
                        "Dimension" => {
                            if let Some(concept) = attr(&e, "conceptRef").or_else(|| attr(&e, "id")) {
                                dimensions.push(Dimension {
                                    id: concept,
                                    codelist_id: attr(&e, "codelist"),
                                });
                            }
                        }
                        "TimeDimension" => {
                            time_dimension = attr(&e, "conceptRef").or_else(|| attr(&e, "id"));
                        }
                        "PrimaryMeasure" => {
                            primary_measure = attr(&e, "conceptRef").or_else(|| attr(&e, "id"));
                        }
                        "Attribute" => {
                            if let Some(concept) = attr(&e, "conceptRef").or_else(|| attr(&e, "id")) {
                                attributes.push(Attribute {
                                    id: concept,
                                    codelist_id: attr(&e, "codelist"),
                                });
                            }
                        }
                        _ => {}
                    }
                }
                Event::Empty(e) => {
                    let name = local_name(&e);
                    match name.as_str() {
                        "Dimension" => {
                            if let Some(concept) = attr(&e, "conceptRef").or_else(|| attr(&e, "id")) {
                                dimensions.push(Dimension {
                                    id: concept,
                                    codelist_id: attr(&e, "codelist"),
                                });
                            }
                        }
                        "TimeDimension" => {
                            time_dimension = attr(&e, "conceptRef").or_else(|| attr(&e, "id"));
                        }
                        "PrimaryMeasure" => {
                            primary_measure = attr(&e, "conceptRef").or_else(|| attr(&e, "id"));
                        }
                        "Attribute" => {
                            if let Some(concept) = attr(&e, "conceptRef").or_else(|| attr(&e, "id")) {
                                attributes.push(Attribute {
                                    id: concept,
                                    codelist_id: attr(&e, "codelist"),
                                });
                            }
                        }
                        "Code" => {
                            // Self-closing <Code value="X"/> with no Description child:
                            // the value attribute doubles as the label.
                            if let Some(cl) = current_codelist.as_mut() {
                                if let Some(code) = attr(&e, "value").or_else(|| attr(&e, "id")) {
                                    let entry = CodeEntry {
                                        label: code.clone(),
                                        description: None,
                                        parent_code: attr(&e, "parentCode"),
                                    };
                                    if let Err(err) = cl.insert(code, entry) {
                                        warn!(error = %err, "skipping duplicate code in codelist");
                                    }
                                }
                            }
                        }
                        _ => {}
                    }
                }
                Event::Text(t) => {
                    if in_description {
                        description_buf.push_str(&t.unescape().unwrap_or_default());
                    }
                }
                Event::End(e) => {
                    let name = local_name_bytes(e.name().as_ref());
                    match name.as_str() {
                        "Description" => {
                            in_description = false;
                        }
                        "Code" => {
                            if let (Some(cl), Some(code)) = (current_codelist.as_mut(), current_code.take()) {
                                let entry = CodeEntry {
                                    label: if description_buf.is_empty() {
                                        code.clone()
                                    } else {
                                        description_buf.clone()
                                    },
                                    description: None,
                                    parent_code: current_parent.take(),
                                };
                                if let Err(e) = cl.insert(code, entry) {
                                    warn!(error = %e, "skipping duplicate code in codelist");
                                }
                            }
                            description_buf.clear();
                        }
                        "CodeList" => {
                            if let Some(cl) = current_codelist.take() {
                                codelists.insert(cl.id.clone(), cl);
                            }
                        }
                        _ => {}
                    }
                }
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        let time_dimension = time_dimension.ok_or_else(|| PipelineError::DsdInvalid {
            dataset_id: dataset_id.clone(),
            reason: "document has no TimeDimension element".to_string(),
        })?;

        let dsd = Dsd::new(
            dataset_id,
            version,
            dimensions,
            attributes,
            primary_measure,
            time_dimension,
            &codelists,
        )?;

        Ok(ParsedStructure { dsd, codelists })
    }

    /// Parse a standalone codelist document (when code lists are
    /// fetched separately from the DSD document).
    pub fn parse_codelist<R: BufRead>(reader: R) -> Result<Codelist, PipelineError> {
        let parsed = Self::parse_codelist_document(reader)?;
        Ok(parsed)
    }

    fn parse_codelist_document<R: BufRead>(reader: R) -> Result<Codelist, PipelineError> {
        let mut xml = Reader::from_reader(reader);
        xml.config_mut().trim_text = true;

        let mut codelist: Option<Codelist> = None;
        let mut current_code: Option<String> = None;
        let mut current_parent: Option<String> = None;
        let mut in_description = false;
        let mut description_buf = String::new();
        let mut buf = Vec::new();

        loop {
            match xml.read_event_into(&mut buf).map_err(|e| PipelineError::DsdInvalid {
                dataset_id: "<codelist>".to_string(),
                reason: format!("XML error: {e}"),
            })? {
                Event::Start(e) => match local_name(&e).as_str() {
                    "CodeList" => {
                        let id = attr(&e, "id").unwrap_or_default();
                        codelist = Some(Codelist::new(id));
                    }
                    "Code" => {
                        current_code = attr(&e, "value").or_else(|| attr(&e, "id"));
                        current_parent = attr(&e, "parentCode");
                    }
                    "Description" => {
                        in_description = true;
                        description_buf.clear();
                    }
                    _ => {}
                },
                Event::Empty(e) => {
                    if local_name(&e) == "Code" {
                        if let Some(cl) = codelist.as_mut() {
                            if let Some(code) = attr(&e, "value").or_else(|| attr(&e, "id")) {
                                let entry = CodeEntry {
                                    label: code.clone(),
                                    description: None,
                                    parent_code: attr(&e, "parentCode"),
                                };
                                if let Err(err) = cl.insert(code, entry) {
                                    warn!(error = %err, "skipping duplicate code in standalone codelist");
                                }
                            }
                        }
                    }
                }
                Event::Text(t) => {
                    if in_description {
                        description_buf.push_str(&t.unescape().unwrap_or_default());
                    }
                }
                Event::End(e) => match local_name_bytes(e.name().as_ref()).as_str() {
                    "Description" => in_description = false,
                    "Code" => {
                        if let (Some(cl), Some(code)) = (codelist.as_mut(), current_code.take()) {
                            let entry = CodeEntry {
                                label: if description_buf.is_empty() {
                                    code.clone()
                                } else {
                                    description_buf.clone()
                                },
                                description: None,
                                parent_code: current_parent.take(),
                            };
                            if let Err(e) = cl.insert(code, entry) {
                                warn!(error = %e, "skipping duplicate code in standalone codelist");
                            }
                        }
                        description_buf.clear();
                    }
                    _ => {}
                },
                Event::Eof => break,
                _ => {}
            }
            buf.clear();
        }

        codelist.ok_or_else(|| PipelineError::DsdInvalid {
            dataset_id: "<codelist>".to_string(),
            reason: "document has no CodeList element".to_string(),
        })
    }
}

fn local_name(e: &quick_xml::events::BytesStart) -> String {
    local_name_bytes(e.name().as_ref())
}

fn local_name_bytes(raw: &[u8]) -> String {
    let s = String::from_utf8_lossy(raw);
    match s.rsplit_once(':') {
        Some((_, local)) => local.to_string(),
        None => s.to_string(),
    }
}

fn attr(e: &quick_xml::events::BytesStart, name: &str) -> Option<String> {
    e.attributes().flatten().find_map(|a| {
        let key = local_name_bytes(a.key.as_ref());
        if key == name {
            Some(String::from_utf8_lossy(&a.value).to_string())
        } else {
            None
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    const DOC: &str = r#"<?xml version="1.0"?>
<Structure>
  <CodeLists>
    <CodeList id="CL_GEO">
      <Code value="DE"><Description>Germany</Description></Code>
      <Code value="FR"><Description>France</Description></Code>
    </CodeList>
    <CodeList id="CL_FREQ">
      <Code value="A"><Description>Annual</Description></Code>
    </CodeList>
  </CodeLists>
  <KeyFamilies>
    <KeyFamily id="nama_10_gdp" version="1.0">
      <Components>
        <Dimension conceptRef="geo" codelist="CL_GEO"/>
        <Dimension conceptRef="freq" codelist="CL_FREQ"/>
        <TimeDimension conceptRef="time"/>
        <PrimaryMeasure conceptRef="obs_value"/>
      </Components>
    </KeyFamily>
  </KeyFamilies>
</Structure>"#;

    #[test]
    fn parses_dsd_and_codelists_in_document_order() {
        let parsed = SdmxParser::parse(DOC.as_bytes()).unwrap();
        assert_eq!(parsed.dsd.dataset_id(), "nama_10_gdp");
        assert_eq!(parsed.dsd.non_time_dimension_ids(), vec!["geo", "freq"]);
        assert_eq!(parsed.dsd.time_dimension(), "time");
        assert_eq!(parsed.codelists.len(), 2);
        assert_eq!(parsed.codelists["CL_GEO"].label_for("DE"), Some("Germany"));
        assert_eq!(parsed.codelists["CL_FREQ"].label_for("A"), Some("Annual"));
    }

    #[test]
    fn rejects_document_without_time_dimension() {
        let doc = DOC.replace("<TimeDimension conceptRef=\"time\"/>", "");
        let err = SdmxParser::parse(doc.as_bytes()).unwrap_err();
        assert!(matches!(err, PipelineError::DsdInvalid { .. }));
    }

    #[test]
    fn parses_standalone_codelist_document() {
        let doc = r#"<CodeList id="CL_GEO">
            <Code value="DE"><Description>Germany</Description></Code>
        </CodeList>"#;
        let cl = SdmxParser::parse_codelist(doc.as_bytes()).unwrap();
        assert_eq!(cl.label_for("DE"), Some("Germany"));
    }
}
