//! Data import: CSV, JSON and XML text into rows

use crate::ast::Node;
use crate::directives::{identifier_attr, infer_literal, required_attr, type_attr};
use crate::error::ParseError;
use crate::types::{coerce, TypeHint, Value};
use anyhow::{anyhow, bail, Context, Result};
use quick_xml::events::Event;
use quick_xml::Reader;
use std::collections::BTreeMap;

/// Maximum XML element nesting accepted by the importer
pub const MAX_XML_DEPTH: usize = 64;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DataFormat {
    Csv,
    Json,
    Xml,
}

impl DataFormat {
    pub fn parse(name: &str) -> Option<DataFormat> {
        match name.trim().to_ascii_lowercase().as_str() {
            "csv" => Some(DataFormat::Csv),
            "json" => Some(DataFormat::Json),
            "xml" => Some(DataFormat::Xml),
            _ => None,
        }
    }
}

/// `<q:field name xpath type>` mapping inside XML Data
#[derive(Debug, Clone, PartialEq)]
pub struct FieldSpec {
    pub name: String,
    pub xpath: String,
    pub type_hint: Option<TypeHint>,
}

impl FieldSpec {
    pub fn from_node(node: &Node) -> Result<Self, ParseError> {
        Ok(Self {
            name: identifier_attr(node, "name")?,
            xpath: required_attr(node, "xpath")?.to_string(),
            type_hint: type_attr(node, "type")?,
        })
    }
}

/// Parsing options for one Data node
#[derive(Debug, Clone, PartialEq)]
pub struct ImportOptions {
    pub format: DataFormat,
    pub delimiter: char,
    pub header: bool,
    /// Dotted path to the rows inside a JSON document
    pub root: Option<String>,
    /// Slash-separated element path of XML rows
    pub item: Option<String>,
    pub fields: Vec<FieldSpec>,
    pub max_depth: usize,
}

impl ImportOptions {
    pub fn new(format: DataFormat) -> Self {
        Self {
            format,
            delimiter: ',',
            header: true,
            root: None,
            item: None,
            fields: Vec::new(),
            max_depth: MAX_XML_DEPTH,
        }
    }
}

/// Parse source text into rows
pub fn import(text: &str, options: &ImportOptions) -> Result<Vec<Value>> {
    match options.format {
        DataFormat::Csv => import_csv(text, options),
        DataFormat::Json => import_json(text, options),
        DataFormat::Xml => import_xml(text, options),
    }
}

// =============================================================================
// CSV
// =============================================================================

fn import_csv(text: &str, options: &ImportOptions) -> Result<Vec<Value>> {
    let records = split_records(text, options.delimiter)?;
    let mut records = records.into_iter();

    let columns: Vec<String> = if options.header {
        match records.next() {
            Some(header) => header.into_iter().map(|c| c.trim().to_string()).collect(),
            None => return Ok(Vec::new()),
        }
    } else {
        Vec::new()
    };

    Ok(records
        .map(|record| {
            let row = record
                .into_iter()
                .enumerate()
                .map(|(i, field)| {
                    let name = columns
                        .get(i)
                        .cloned()
                        .unwrap_or_else(|| format!("column{}", i + 1));
                    (name, infer_literal(&field))
                })
                .collect::<BTreeMap<_, _>>();
            Value::Object(row)
        })
        .collect())
}

/// Split CSV text into records, honoring double-quoted fields
fn split_records(text: &str, delimiter: char) -> Result<Vec<Vec<String>>> {
    let mut records = Vec::new();
    let mut record = Vec::new();
    let mut field = String::new();
    let mut quoted = false;
    let mut chars = text.chars().peekable();

    while let Some(c) = chars.next() {
        if quoted {
            match c {
                '"' if chars.peek() == Some(&'"') => {
                    chars.next();
                    field.push('"');
                }
                '"' => quoted = false,
                _ => field.push(c),
            }
            continue;
        }
        match c {
            '"' if field.is_empty() => quoted = true,
            '\r' => {}
            '\n' => {
                record.push(std::mem::take(&mut field));
                if !(record.len() == 1 && record[0].is_empty()) {
                    records.push(std::mem::take(&mut record));
                }
                record.clear();
            }
            c if c == delimiter => record.push(std::mem::take(&mut field)),
            _ => field.push(c),
        }
    }
    if quoted {
        bail!("unterminated quoted field in CSV");
    }
    if !field.is_empty() || !record.is_empty() {
        record.push(field);
        records.push(record);
    }
    Ok(records)
}

// =============================================================================
// JSON
// =============================================================================

fn import_json(text: &str, options: &ImportOptions) -> Result<Vec<Value>> {
    let json: serde_json::Value = serde_json::from_str(text).context("invalid JSON data")?;
    let mut value = Value::from_json(json);
    if let Some(root) = &options.root {
        for segment in root.split('.').filter(|s| !s.is_empty()) {
            value = value.member(segment);
        }
        if value.is_undefined() {
            bail!("JSON root '{}' not found", root);
        }
    }
    Ok(match value {
        Value::Array(rows) => rows,
        Value::Null => Vec::new(),
        other => vec![other],
    })
}

// =============================================================================
// XML
// =============================================================================

#[derive(Debug, Default)]
struct Element {
    name: String,
    attributes: Vec<(String, String)>,
    text: String,
    children: Vec<Element>,
}

impl Element {
    fn child(&self, name: &str) -> Option<&Element> {
        self.children.iter().find(|c| c.name == name)
    }
}

fn parse_xml(text: &str, max_depth: usize) -> Result<Element> {
    let mut reader = Reader::from_str(text);
    reader.config_mut().trim_text(true);

    let mut stack: Vec<Element> = Vec::new();
    let mut root = None;

    let open = |e: &quick_xml::events::BytesStart<'_>| -> Result<Element> {
        let mut element = Element {
            name: String::from_utf8_lossy(e.name().as_ref()).into_owned(),
            ..Element::default()
        };
        for attr in e.attributes() {
            let attr = attr.context("malformed XML attribute")?;
            element.attributes.push((
                String::from_utf8_lossy(attr.key.as_ref()).into_owned(),
                attr.unescape_value()
                    .context("malformed XML attribute")?
                    .into_owned(),
            ));
        }
        Ok(element)
    };

    loop {
        let event = reader
            .read_event()
            .with_context(|| format!("malformed XML at byte {}", reader.buffer_position()))?;
        match event {
            Event::Start(e) => {
                if stack.len() >= max_depth {
                    bail!("XML nesting exceeds maximum depth of {}", max_depth);
                }
                stack.push(open(&e)?);
            }
            Event::Empty(e) => {
                let element = open(&e)?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => root = Some(element),
                }
            }
            Event::Text(e) => {
                if let Some(current) = stack.last_mut() {
                    current
                        .text
                        .push_str(&e.unescape().context("malformed XML text")?);
                }
            }
            Event::CData(e) => {
                if let Some(current) = stack.last_mut() {
                    current.text.push_str(&String::from_utf8_lossy(&e.into_inner()));
                }
            }
            Event::End(_) => {
                let element = stack.pop().ok_or_else(|| anyhow!("unbalanced XML end tag"))?;
                match stack.last_mut() {
                    Some(parent) => parent.children.push(element),
                    None => root = Some(element),
                }
            }
            Event::Eof => break,
            _ => {}
        }
    }

    if !stack.is_empty() {
        bail!("unclosed XML element '{}'", stack[stack.len() - 1].name);
    }
    root.ok_or_else(|| anyhow!("XML document has no root element"))
}

/// Elements reached by a slash-separated path below (or naming) the root
fn select<'e>(root: &'e Element, path: &str) -> Vec<&'e Element> {
    let mut segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    if segments.first() == Some(&root.name.as_str()) {
        segments.remove(0);
        if segments.is_empty() {
            return vec![root];
        }
    }
    let mut current = vec![root];
    for segment in segments {
        current = current
            .into_iter()
            .flat_map(|e| e.children.iter().filter(move |c| c.name == segment))
            .collect();
    }
    current
}

/// Evaluate a field path (`a/b`, `@attr`, `a/@attr`, `text()`) on one row
fn field_value(row: &Element, xpath: &str) -> Value {
    let mut element = row;
    let segments: Vec<&str> = xpath.split('/').filter(|s| !s.is_empty() && *s != ".").collect();
    for (i, segment) in segments.iter().enumerate() {
        let last = i + 1 == segments.len();
        if let Some(attr) = segment.strip_prefix('@') {
            if !last {
                return Value::Undefined;
            }
            return element
                .attributes
                .iter()
                .find(|(k, _)| k == attr)
                .map(|(_, v)| infer_literal(v))
                .unwrap_or_default();
        }
        if *segment == "text()" {
            return infer_literal(element.text.trim());
        }
        match element.child(segment) {
            Some(child) => element = child,
            None => return Value::Undefined,
        }
    }
    infer_literal(element.text.trim())
}

fn default_row(element: &Element) -> Value {
    let mut row = BTreeMap::new();
    for (key, value) in &element.attributes {
        row.insert(key.clone(), infer_literal(value));
    }
    for child in &element.children {
        row.insert(child.name.clone(), infer_literal(child.text.trim()));
    }
    Value::Object(row)
}

fn import_xml(text: &str, options: &ImportOptions) -> Result<Vec<Value>> {
    let root = parse_xml(text, options.max_depth)?;
    let items: Vec<&Element> = match &options.item {
        Some(path) => select(&root, path),
        None => root.children.iter().collect(),
    };

    items
        .into_iter()
        .map(|item| {
            if options.fields.is_empty() {
                return Ok(default_row(item));
            }
            let mut row = BTreeMap::new();
            for field in &options.fields {
                let value = field_value(item, &field.xpath);
                let value = match field.type_hint {
                    Some(hint) => coerce(value, hint)
                        .with_context(|| format!("field '{}'", field.name))?,
                    None => value,
                };
                row.insert(field.name.clone(), value);
            }
            Ok(Value::Object(row))
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_csv_with_quotes_and_header() {
        let text = "id,name,note\n1,\"Smith, J\",\"said \"\"hi\"\"\"\n2,Lee,\n";
        let rows = import(text, &ImportOptions::new(DataFormat::Csv)).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].member("id"), Value::Integer(1));
        assert_eq!(rows[0].member("name"), Value::from("Smith, J"));
        assert_eq!(rows[0].member("note"), Value::from("said \"hi\""));
        assert_eq!(rows[1].member("note"), Value::from(""));
    }

    #[test]
    fn test_csv_without_header_and_custom_delimiter() {
        let mut options = ImportOptions::new(DataFormat::Csv);
        options.header = false;
        options.delimiter = ';';
        let rows = import("a;b\nc;d", &options).unwrap();
        assert_eq!(rows[1].member("column2"), Value::from("d"));
    }

    #[test]
    fn test_csv_unterminated_quote() {
        let err = import("a\n\"oops", &ImportOptions::new(DataFormat::Csv)).unwrap_err();
        assert_eq!(err.to_string(), "unterminated quoted field in CSV");
    }

    #[test]
    fn test_json_root_path() {
        let mut options = ImportOptions::new(DataFormat::Json);
        options.root = Some("payload.items".to_string());
        let rows = import(r#"{"payload": {"items": [{"a": 1}, {"a": 2}]}}"#, &options).unwrap();
        assert_eq!(rows.len(), 2);

        options.root = Some("missing".to_string());
        assert!(import(r#"{"payload": 1}"#, &options).is_err());
    }

    #[test]
    fn test_xml_fields() {
        let text = r#"<catalog>
            <book id="7"><title>Dune</title><price>9.5</price></book>
            <book id="8"><title>Emma</title><price>4</price></book>
        </catalog>"#;
        let mut options = ImportOptions::new(DataFormat::Xml);
        options.item = Some("catalog/book".to_string());
        options.fields = vec![
            FieldSpec {
                name: "id".to_string(),
                xpath: "@id".to_string(),
                type_hint: None,
            },
            FieldSpec {
                name: "title".to_string(),
                xpath: "title/text()".to_string(),
                type_hint: None,
            },
            FieldSpec {
                name: "price".to_string(),
                xpath: "price".to_string(),
                type_hint: Some(TypeHint::Decimal),
            },
        ];
        let rows = import(text, &options).unwrap();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].member("id"), Value::Integer(7));
        assert_eq!(rows[1].member("title"), Value::from("Emma"));
        assert_eq!(rows[1].member("price"), Value::Decimal(4.0));
    }

    #[test]
    fn test_xml_default_rows() {
        let rows = import(
            "<list><item k=\"x\"><v>1</v></item></list>",
            &ImportOptions::new(DataFormat::Xml),
        )
        .unwrap();
        assert_eq!(rows[0].member("k"), Value::from("x"));
        assert_eq!(rows[0].member("v"), Value::Integer(1));
    }

    #[test]
    fn test_xml_depth_is_bounded() {
        let mut options = ImportOptions::new(DataFormat::Xml);
        options.max_depth = 3;
        let err = import("<a><b><c><d/></c></b></a>", &options);
        assert!(err.is_ok());
        let err = import("<a><b><c><d>x</d></c></b></a>", &options).unwrap_err();
        assert_eq!(err.to_string(), "XML nesting exceeds maximum depth of 3");
    }
}
