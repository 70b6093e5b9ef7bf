//! Persisted replace definitions.
//!
//! INI layout, one section per replacement:
//!
//! ```ini
//! [temperature]
//! replace = Input_Word_1
//! frm = h
//! byteorder = big
//! defaultvalue = 20
//! ```
//!
//! Exported files load back into identical replacements: same name, type
//! code, bit, byte and word order, default bytes and export flag.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use thiserror::Error;

use super::address::{DefaultSpec, DefaultValue, IoDescriptor};
use super::format::int_from_bytes;
use super::replace::ReplaceRequest;
use super::types::ByteOrder;

/// Errors while reading or writing a replace file.
#[derive(Debug, Error)]
pub enum ReplaceFileError {
    /// File could not be read or written.
    #[error("replace_io_file: {0}")]
    Io(#[from] std::io::Error),

    /// Line is neither a section, a key/value pair nor a comment.
    #[error("replace_io_file: syntax error in line {line}: '{text}'")]
    Syntax { line: usize, text: String },

    /// Key/value pair before the first section.
    #[error("replace_io_file: key in line {0} outside of a section")]
    NoSection(usize),

    /// Required key absent.
    #[error("replace_io_file: section '{section}' has no key '{key}'")]
    MissingKey { section: String, key: &'static str },

    /// Value could not be converted.
    #[error("replace_io_file: could not convert '{section}' {key} '{value}' to {expected}")]
    InvalidValue {
        section: String,
        key: &'static str,
        value: String,
        expected: &'static str,
    },
}

/// One section of the file: which IO to replace and how.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplaceDefinition {
    /// IO to replace.
    pub parent: String,
    /// The replacement.
    pub request: ReplaceRequest,
}

// ─── INI reader ─────────────────────────────────────────────────────

type Section = (String, Vec<(String, String)>);

fn parse_ini(text: &str) -> Result<Vec<Section>, ReplaceFileError> {
    let mut sections: Vec<Section> = Vec::new();
    for (idx, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
            continue;
        }
        if let Some(rest) = line.strip_prefix('[') {
            let name = rest.strip_suffix(']').ok_or_else(|| ReplaceFileError::Syntax {
                line: idx + 1,
                text: raw.to_string(),
            })?;
            sections.push((name.trim().to_string(), Vec::new()));
            continue;
        }
        let split = line.find(['=', ':']).ok_or_else(|| ReplaceFileError::Syntax {
            line: idx + 1,
            text: raw.to_string(),
        })?;
        let key = line[..split].trim().to_ascii_lowercase();
        let value = line[split + 1..].trim().to_string();
        let (_, entries) = sections
            .last_mut()
            .ok_or(ReplaceFileError::NoSection(idx + 1))?;
        entries.retain(|(k, _)| *k != key);
        entries.push((key, value));
    }
    Ok(sections)
}

fn lookup<'a>(entries: &'a [(String, String)], key: &str) -> Option<&'a str> {
    entries
        .iter()
        .find(|(k, _)| k == key)
        .map(|(_, v)| v.as_str())
}

fn parse_bool(value: &str) -> Option<bool> {
    match value.to_ascii_lowercase().as_str() {
        "1" | "yes" | "true" | "on" => Some(true),
        "0" | "no" | "false" | "off" => Some(false),
        _ => None,
    }
}

impl ReplaceDefinition {
    fn from_section(section: &str, entries: &[(String, String)]) -> Result<Self, ReplaceFileError> {
        let invalid = |key: &'static str, value: &str, expected: &'static str| {
            ReplaceFileError::InvalidValue {
                section: section.to_string(),
                key,
                value: value.to_string(),
                expected,
            }
        };
        let required = |key: &'static str| {
            lookup(entries, key).ok_or_else(|| ReplaceFileError::MissingKey {
                section: section.to_string(),
                key,
            })
        };
        let order = |key: &'static str, value: &str| {
            value
                .parse::<ByteOrder>()
                .map_err(|_| invalid(key, value, "'little' or 'big'"))
        };

        let parent = required("replace")?.to_string();
        let format = required("frm")?.to_string();

        let mut request = ReplaceRequest::new(section, format.clone());
        request.byte_order = Some(match lookup(entries, "byteorder") {
            Some(v) => order("byteorder", v)?,
            None => ByteOrder::Little,
        });
        request.bmk = lookup(entries, "bmk").unwrap_or_default().to_string();
        if let Some(v) = lookup(entries, "bit") {
            request.bit = Some(v.parse().map_err(|_| invalid("bit", v, "integer"))?);
        }
        if let Some(v) = lookup(entries, "wordorder") {
            request.word_order = Some(order("wordorder", v)?);
        }
        if let Some(v) = lookup(entries, "export") {
            request.export = Some(parse_bool(v).ok_or_else(|| invalid("export", v, "bool"))?);
        }
        if let Some(v) = lookup(entries, "defaultvalue") {
            request.default = if format == "?" {
                DefaultSpec::Bool(parse_bool(v).ok_or_else(|| invalid("defaultvalue", v, "boolean"))?)
            } else if format.ends_with('s') {
                let bytes = v
                    .split_whitespace()
                    .map(str::parse::<u8>)
                    .collect::<Result<Vec<_>, _>>()
                    .map_err(|_| invalid("defaultvalue", v, "bytes"))?;
                DefaultSpec::Bytes(bytes)
            } else {
                DefaultSpec::Int(v.parse().map_err(|_| invalid("defaultvalue", v, "integer"))?)
            };
        }
        Ok(Self { parent, request })
    }

    /// Definition that recreates a replacement IO.
    ///
    /// Returns `None` for IOs that are not replacements.
    pub fn from_descriptor(io: &IoDescriptor) -> Option<Self> {
        let info = io.struct_info()?;
        let mut request = ReplaceRequest::new(io.name.clone(), info.format.code());
        request.byte_order = Some(io.byte_order);
        request.word_order = info.word_order;
        request.bmk = io.bmk.clone();
        if let Some(bit) = io.bit {
            request.bit = Some(((io.address - info.parent_address) * 8) as u32 + bit as u32);
        }
        if io.export & 2 != 0 {
            request.export = Some(io.export_flag());
        }
        request.default = match &io.default {
            DefaultValue::Bool(true) => DefaultSpec::Bool(true),
            DefaultValue::Bool(false) => DefaultSpec::None,
            DefaultValue::Bytes(b) if b.iter().all(|&x| x == 0) => DefaultSpec::None,
            DefaultValue::Bytes(b) if info.format.is_blob() => DefaultSpec::Bytes(b.clone()),
            DefaultValue::Bytes(b) => DefaultSpec::Int(int_from_bytes(b, io.byte_order, false)),
        };
        Some(Self {
            parent: info.parent.clone(),
            request,
        })
    }

    fn render_into(&self, out: &mut String) {
        let r = &self.request;
        let _ = writeln!(out, "[{}]", r.name);
        let _ = writeln!(out, "replace = {}", self.parent);
        let _ = writeln!(out, "frm = {}", r.format);
        if let Some(bit) = r.bit {
            let _ = writeln!(out, "bit = {bit}");
        }
        if r.byte_order == Some(ByteOrder::Big) {
            let _ = writeln!(out, "byteorder = big");
        }
        if let Some(order) = r.word_order {
            let _ = writeln!(out, "wordorder = {order}");
        }
        match &r.default {
            DefaultSpec::None => {}
            DefaultSpec::Bool(b) => {
                let _ = writeln!(out, "defaultvalue = {b}");
            }
            DefaultSpec::Int(i) => {
                let _ = writeln!(out, "defaultvalue = {i}");
            }
            DefaultSpec::Bytes(b) => {
                let joined: Vec<String> = b.iter().map(u8::to_string).collect();
                let _ = writeln!(out, "defaultvalue = {}", joined.join(" "));
            }
            DefaultSpec::Text(t) => {
                let _ = writeln!(out, "defaultvalue = {t}");
            }
        }
        if !r.bmk.is_empty() {
            let _ = writeln!(out, "bmk = {}", r.bmk);
        }
        if let Some(export) = r.export {
            let _ = writeln!(out, "export = {}", export as u8);
        }
        out.push('\n');
    }
}

// ─── Public API ─────────────────────────────────────────────────────

/// Parse replace definitions; the `DEFAULT` section is ignored.
pub fn parse(text: &str) -> Result<Vec<ReplaceDefinition>, ReplaceFileError> {
    parse_ini(text)?
        .iter()
        .filter(|(name, _)| name != "DEFAULT")
        .map(|(name, entries)| ReplaceDefinition::from_section(name, entries))
        .collect()
}

/// Read a replace file.
pub fn load(path: &Path) -> Result<Vec<ReplaceDefinition>, ReplaceFileError> {
    parse(&fs::read_to_string(path)?)
}

/// Render definitions as INI text.
pub fn render(definitions: &[ReplaceDefinition]) -> String {
    let mut out = String::new();
    for def in definitions {
        def.render_into(&mut out);
    }
    out
}

/// Write definitions to `path`.
pub fn save(path: &Path, definitions: &[ReplaceDefinition]) -> Result<(), ReplaceFileError> {
    fs::write(path, render(definitions))?;
    Ok(())
}
