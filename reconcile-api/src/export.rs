use std::borrow::Cow;
use std::collections::{BTreeSet, HashMap};
use std::fmt::Write as _;
use std::io::{Cursor, Write};

use quick_xml::escape::escape;
use serde_json::Value;
use thiserror::Error;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipWriter};

use reconcile_common::record::{
    StoredEntity, EMAIL_FIELD, INSERTED_AT_FIELD, NAME_FIELD, PHONE_FIELD,
};

pub const EXPORT_FILENAME: &str = "records.xlsx";
pub const EXPORT_SHEET: &str = "Data";

#[derive(Error, Debug)]
pub enum ExportError {
    #[error("failed to build workbook archive: {0}")]
    Zip(#[from] zip::result::ZipError),
    #[error("failed to write workbook: {0}")]
    Io(#[from] std::io::Error),
}

const CONTENT_TYPES: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Types xmlns="http://schemas.openxmlformats.org/package/2006/content-types"><Default Extension="rels" ContentType="application/vnd.openxmlformats-package.relationships+xml"/><Default Extension="xml" ContentType="application/xml"/><Override PartName="/xl/workbook.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sheet.main+xml"/><Override PartName="/xl/worksheets/sheet1.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.worksheet+xml"/><Override PartName="/xl/sharedStrings.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.sharedStrings+xml"/><Override PartName="/xl/styles.xml" ContentType="application/vnd.openxmlformats-officedocument.spreadsheetml.styles+xml"/></Types>"#;

const ROOT_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/officeDocument" Target="xl/workbook.xml"/></Relationships>"#;

const WORKBOOK_RELS: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<Relationships xmlns="http://schemas.openxmlformats.org/package/2006/relationships"><Relationship Id="rId1" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/worksheet" Target="worksheets/sheet1.xml"/><Relationship Id="rId2" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/sharedStrings" Target="sharedStrings.xml"/><Relationship Id="rId3" Type="http://schemas.openxmlformats.org/officeDocument/2006/relationships/styles" Target="styles.xml"/></Relationships>"#;

const STYLES: &str = r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<styleSheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><fonts count="1"><font><sz val="11"/><name val="Calibri"/></font></fonts><fills count="1"><fill><patternFill patternType="none"/></fill></fills><borders count="1"><border/></borders><cellStyleXfs count="1"><xf numFmtId="0" fontId="0" fillId="0" borderId="0"/></cellStyleXfs><cellXfs count="1"><xf numFmtId="0" fontId="0" fillId="0" borderId="0" xfId="0"/></cellXfs></styleSheet>"#;

/// Column order of an export: identity fields, every attribute name sorted, then the
/// insertion time. The store id is left out.
pub fn export_columns(entities: &[StoredEntity]) -> Vec<String> {
    let attributes: BTreeSet<&String> = entities
        .iter()
        .flat_map(|entity| entity.attributes.keys())
        .collect();

    [NAME_FIELD, EMAIL_FIELD, PHONE_FIELD]
        .into_iter()
        .map(str::to_owned)
        .chain(attributes.into_iter().cloned())
        .chain(std::iter::once(INSERTED_AT_FIELD.to_owned()))
        .collect()
}

/// Render entities as a single-sheet xlsx workbook.
pub fn write_workbook(entities: &[StoredEntity]) -> Result<Vec<u8>, ExportError> {
    let columns = export_columns(entities);
    let mut strings = SharedStrings::default();
    let mut sheet = String::new();

    sheet.push_str(r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>"#);
    sheet.push_str(
        r#"<worksheet xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main"><sheetData>"#,
    );

    let header: Vec<Value> = columns.iter().cloned().map(Value::String).collect();
    write_row(&mut sheet, &mut strings, 1, &header);
    for (index, entity) in entities.iter().enumerate() {
        let cells: Vec<Value> = columns
            .iter()
            .map(|column| entity.field(column).unwrap_or(Value::Null))
            .collect();
        write_row(&mut sheet, &mut strings, index + 2, &cells);
    }
    sheet.push_str("</sheetData></worksheet>");

    let workbook = format!(
        r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<workbook xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" xmlns:r="http://schemas.openxmlformats.org/officeDocument/2006/relationships"><sheets><sheet name="{}" sheetId="1" r:id="rId1"/></sheets></workbook>"#,
        escape(EXPORT_SHEET)
    );

    let shared_strings = strings.to_xml();

    let mut buffer = Cursor::new(Vec::new());
    {
        let mut zip = ZipWriter::new(&mut buffer);
        let options = SimpleFileOptions::default().compression_method(CompressionMethod::Deflated);

        for (path, contents) in [
            ("[Content_Types].xml", CONTENT_TYPES),
            ("_rels/.rels", ROOT_RELS),
            ("xl/workbook.xml", workbook.as_str()),
            ("xl/_rels/workbook.xml.rels", WORKBOOK_RELS),
            ("xl/styles.xml", STYLES),
            ("xl/worksheets/sheet1.xml", sheet.as_str()),
            ("xl/sharedStrings.xml", shared_strings.as_str()),
        ] {
            zip.start_file(path, options)?;
            zip.write_all(contents.as_bytes())?;
        }
        zip.finish()?;
    }

    Ok(buffer.into_inner())
}

#[derive(Default)]
struct SharedStrings {
    index: HashMap<String, usize>,
    values: Vec<String>,
    uses: usize,
}

impl SharedStrings {
    fn intern(&mut self, value: &str) -> usize {
        self.uses += 1;
        let value = xml_safe(value);
        if let Some(&i) = self.index.get(&*value) {
            return i;
        }
        let i = self.values.len();
        self.values.push(value.clone().into_owned());
        self.index.insert(value.into_owned(), i);
        i
    }

    fn to_xml(&self) -> String {
        let mut xml = format!(
            r#"<?xml version="1.0" encoding="UTF-8" standalone="yes"?>
<sst xmlns="http://schemas.openxmlformats.org/spreadsheetml/2006/main" count="{}" uniqueCount="{}">"#,
            self.uses,
            self.values.len()
        );
        for value in &self.values {
            let _ = write!(xml, r#"<si><t xml:space="preserve">{}</t></si>"#, escape(value));
        }
        xml.push_str("</sst>");
        xml
    }
}

fn write_row(sheet: &mut String, strings: &mut SharedStrings, row: usize, cells: &[Value]) {
    let _ = write!(sheet, r#"<row r="{row}">"#);
    for (col, value) in cells.iter().enumerate() {
        let reference = format!("{}{row}", column_name(col));
        let _ = match value {
            Value::Null => continue,
            Value::Number(n) => write!(sheet, r#"<c r="{reference}"><v>{n}</v></c>"#),
            Value::Bool(b) => write!(sheet, r#"<c r="{reference}" t="b"><v>{}</v></c>"#, u8::from(*b)),
            Value::String(s) => write!(
                sheet,
                r#"<c r="{reference}" t="s"><v>{}</v></c>"#,
                strings.intern(s)
            ),
            // Nested values have no cell type of their own.
            other => write!(
                sheet,
                r#"<c r="{reference}" t="s"><v>{}</v></c>"#,
                strings.intern(&other.to_string())
            ),
        };
    }
    sheet.push_str("</row>");
}

/// XML 1.0 cannot carry most control characters, not even escaped. They are dropped.
fn xml_safe(value: &str) -> Cow<'_, str> {
    if value.chars().all(is_xml_char) {
        Cow::Borrowed(value)
    } else {
        Cow::Owned(value.chars().filter(|c| is_xml_char(*c)).collect())
    }
}

fn is_xml_char(c: char) -> bool {
    matches!(
        c,
        '\t' | '\n' | '\r' | '\u{20}'..='\u{D7FF}' | '\u{E000}'..='\u{FFFD}' | '\u{10000}'..='\u{10FFFF}'
    )
}

/// Zero-based column index to its spreadsheet letters: 0 → A, 25 → Z, 26 → AA.
fn column_name(mut col: usize) -> String {
    let mut name = Vec::new();
    loop {
        name.push(b'A' + (col % 26) as u8);
        if col < 26 {
            break;
        }
        col = col / 26 - 1;
    }
    name.reverse();
    String::from_utf8_lossy(&name).into_owned()
}
