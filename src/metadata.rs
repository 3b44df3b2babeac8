//! Metadata extraction from DIA-NN logs and FASTA databases.

use std::collections::HashMap;
use std::fmt;
use std::fs;
use std::path::Path;
use std::sync::OnceLock;

use regex::Regex;
use serde::Serialize;
use serde::ser::{SerializeMap, Serializer};

use crate::error::ObisError;

const TOP_SPECIES: usize = 5;
const NON_SPECIES_MARKERS: [&str; 4] = ["fragment", "partial", "predicted", "uncharacterized"];

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum MetaValue {
    Int(i64),
    Float(f64),
    Text(String),
}

impl fmt::Display for MetaValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MetaValue::Int(value) => write!(f, "{value}"),
            MetaValue::Float(value) if value.fract() == 0.0 => write!(f, "{value:.1}"),
            MetaValue::Float(value) => write!(f, "{value}"),
            MetaValue::Text(value) => f.write_str(value),
        }
    }
}

impl From<&str> for MetaValue {
    fn from(value: &str) -> Self {
        MetaValue::Text(value.to_string())
    }
}

impl From<String> for MetaValue {
    fn from(value: String) -> Self {
        MetaValue::Text(value)
    }
}

impl From<i64> for MetaValue {
    fn from(value: i64) -> Self {
        MetaValue::Int(value)
    }
}

/// Extracted fields in extraction order. Keys are upper-case names such as
/// `N_PROTEINS`; inserting an existing key replaces its value in place.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Metadata {
    entries: Vec<(String, MetaValue)>,
}

impl Metadata {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, key: &str, value: impl Into<MetaValue>) {
        let value = value.into();
        match self.entries.iter_mut().find(|(existing, _)| existing == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key.to_string(), value)),
        }
    }

    pub fn get(&self, key: &str) -> Option<&MetaValue> {
        self.entries
            .iter()
            .find(|(existing, _)| existing == key)
            .map(|(_, value)| value)
    }

    pub fn contains(&self, key: &str) -> bool {
        self.get(key).is_some()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &MetaValue)> {
        self.entries.iter().map(|(key, value)| (key.as_str(), value))
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Serialize for Metadata {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(self.entries.len()))?;
        for (key, value) in &self.entries {
            map.serialize_entry(key, value)?;
        }
        map.end()
    }
}

struct DiannPatterns {
    version: Regex,
    compiled: Regex,
    generated: Regex,
    precursors: Regex,
    proteins: Regex,
    genes: Regex,
    fasta: Regex,
    cut: Regex,
    threads: Regex,
    cores: Regex,
    integer_flags: Vec<(&'static str, Regex)>,
}

fn diann_patterns() -> &'static DiannPatterns {
    static PATTERNS: OnceLock<DiannPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let re = |pattern: &str| Regex::new(pattern).unwrap_or_else(|err| panic!("{err}"));
        let flags = [
            ("MIN_PEPTIDE_LENGTH", "min-pep-len"),
            ("MAX_PEPTIDE_LENGTH", "max-pep-len"),
            ("MIN_PRECURSOR_MZ", "min-pr-mz"),
            ("MAX_PRECURSOR_MZ", "max-pr-mz"),
            ("MIN_PRECURSOR_CHARGE", "min-pr-charge"),
            ("MAX_PRECURSOR_CHARGE", "max-pr-charge"),
            ("MIN_FRAGMENT_MZ", "min-fr-mz"),
            ("MAX_FRAGMENT_MZ", "max-fr-mz"),
            ("MISSED_CLEAVAGES", "missed-cleavages"),
        ];
        DiannPatterns {
            version: re(r"DIA-NN ([\d.]+)"),
            compiled: re(r"Compiled on (.+)"),
            generated: re(r"Current date and time: (.+)"),
            precursors: re(r"(\d+) precursors generated"),
            proteins: re(r"Library contains (\d+) proteins"),
            genes: re(r"and (\d+) genes"),
            fasta: re(r"--fasta (\S+)"),
            cut: re(r"--cut (\S+)"),
            threads: re(r"Thread number set to (\d+)"),
            cores: re(r"Logical CPU cores: (\d+)"),
            integer_flags: flags
                .into_iter()
                .map(|(key, flag)| (key, re(&format!(r"--{flag} (\d+)"))))
                .collect(),
        }
    })
}

pub fn parse_diann_log(path: &Path) -> Result<Metadata, ObisError> {
    let content = fs::read_to_string(path)
        .map_err(|err| ObisError::Metadata(format!("{}: {err}", path.display())))?;
    Ok(parse_diann_text(&content))
}

pub fn parse_diann_text(content: &str) -> Metadata {
    let patterns = diann_patterns();
    let mut metadata = Metadata::new();

    let capture = |regex: &Regex| {
        regex
            .captures(content)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().trim().to_string())
    };
    let capture_int = |regex: &Regex| capture(regex).and_then(|value| value.parse::<i64>().ok());

    if let Some(version) = capture(&patterns.version) {
        metadata.insert("DIANN_VERSION", version);
    }
    if let Some(date) = capture(&patterns.compiled) {
        metadata.insert("COMPILE_DATE", date);
    }
    if let Some(date) = capture(&patterns.generated) {
        metadata.insert("GENERATION_DATE", date);
    }
    if let Some(count) = capture_int(&patterns.precursors) {
        metadata.insert("N_PRECURSORS", count);
    }
    if let Some(count) = capture_int(&patterns.proteins) {
        metadata.insert("N_PROTEINS", count);
    }
    if let Some(count) = capture_int(&patterns.genes) {
        metadata.insert("N_GENES", count);
    }
    if let Some(fasta) = capture(&patterns.fasta) {
        let basename = fasta
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or(fasta.as_str())
            .to_string();
        metadata.insert("FASTA_DATABASE", basename);
        metadata.insert("FASTA_PATH", fasta);
    }
    for (key, regex) in &patterns.integer_flags {
        if let Some(value) = capture_int(regex) {
            metadata.insert(key, value);
        }
    }
    if let Some(sites) = capture(&patterns.cut) {
        metadata.insert("CLEAVAGE_SITES", sites);
    }

    let methods = [
        ("Deep learning will be used", "Deep learning prediction"),
        ("--gen-spec-lib", "In silico library generation"),
        ("--predictor", "RT predictor"),
    ];
    if let Some(joined) = joined_markers(content, &methods) {
        metadata.insert("GENERATION_METHOD", joined);
    }

    let modifications = [
        (
            "Cysteine carbamidomethylation enabled",
            "Cysteine carbamidomethylation (fixed)",
        ),
        ("--met-excision", "N-terminal methionine excision"),
        ("--unimod4", "Unimod modifications"),
    ];
    if let Some(joined) = joined_markers(content, &modifications) {
        metadata.insert("MODIFICATIONS", joined);
    }

    if let Some(threads) = capture_int(&patterns.threads) {
        metadata.insert("THREADS_USED", threads);
    }
    if let Some(cores) = capture_int(&patterns.cores) {
        metadata.insert("SYSTEM_CORES", cores);
    }
    metadata
}

fn joined_markers(content: &str, markers: &[(&str, &str)]) -> Option<String> {
    let found = markers
        .iter()
        .filter(|(marker, _)| content.contains(marker))
        .map(|(_, label)| *label)
        .collect::<Vec<_>>();
    (!found.is_empty()).then(|| found.join(", "))
}

struct SpeciesPatterns {
    uniprot: Regex,
    ncbi: Regex,
    parenthesized: Regex,
}

fn species_patterns() -> &'static SpeciesPatterns {
    static PATTERNS: OnceLock<SpeciesPatterns> = OnceLock::new();
    PATTERNS.get_or_init(|| {
        let re = |pattern: &str| Regex::new(pattern).unwrap_or_else(|err| panic!("{err}"));
        SpeciesPatterns {
            uniprot: re(r"OS=([^=]+?)(?:\s+[A-Z]{2}=|$)"),
            ncbi: re(r"\[([^\]]+)\]"),
            parenthesized: re(r"\(([^)]+)\)"),
        }
    })
}

/// Species named in a FASTA header line, if any.
///
/// UniProt `OS=` wins over NCBI `[...]`, which wins over a parenthesized name.
pub fn header_species(header: &str) -> Option<String> {
    let patterns = species_patterns();
    let first_group = |regex: &Regex| {
        regex
            .captures(header)
            .and_then(|caps| caps.get(1))
            .map(|m| m.as_str().trim().to_string())
    };
    if header.contains("OS=") {
        first_group(&patterns.uniprot)
    } else if header.contains('[') && header.contains(']') {
        first_group(&patterns.ncbi)
    } else if header.contains('(') && header.contains(')') {
        first_group(&patterns.parenthesized).filter(|species| {
            let lower = species.to_lowercase();
            !NON_SPECIES_MARKERS.iter().any(|marker| lower.contains(marker))
        })
    } else {
        None
    }
}

pub fn parse_fasta_metadata(path: &Path, version: Option<&str>) -> Result<Metadata, ObisError> {
    let content = fs::read_to_string(path)
        .map_err(|err| ObisError::Metadata(format!("{}: {err}", path.display())))?;
    let size = fs::metadata(path)
        .map_err(|err| ObisError::Metadata(format!("{}: {err}", path.display())))?
        .len();
    Ok(summarize_fasta(&content, size, version))
}

pub fn summarize_fasta(content: &str, file_size: u64, version: Option<&str>) -> Metadata {
    let mut total_entries = 0i64;
    let mut order: Vec<String> = Vec::new();
    let mut counts: HashMap<String, i64> = HashMap::new();

    for line in content.lines() {
        let line = line.trim_end();
        if !line.starts_with('>') {
            continue;
        }
        total_entries += 1;
        if let Some(species) = header_species(line) {
            let count = counts.entry(species.clone()).or_insert(0);
            if *count == 0 {
                order.push(species);
            }
            *count += 1;
        }
    }

    let mut metadata = Metadata::new();
    metadata.insert("N_ENTRIES", total_entries);

    if !order.is_empty() {
        let mut ranked = order
            .iter()
            .map(|species| (species.as_str(), counts[species]))
            .collect::<Vec<_>>();
        // stable: equal counts keep first-seen order
        ranked.sort_by(|a, b| b.1.cmp(&a.1));

        metadata.insert("PRIMARY_SPECIES", ranked[0].0);
        metadata.insert("SPECIES_COUNT", order.len() as i64);
        let breakdown = ranked
            .iter()
            .take(TOP_SPECIES)
            .map(|(species, count)| {
                let pct = *count as f64 / total_entries as f64 * 100.0;
                format!("{species} ({count}, {pct:.1}%)")
            })
            .collect::<Vec<_>>()
            .join("; ");
        metadata.insert("SPECIES_BREAKDOWN", breakdown);
    }

    if let Some(version) = version.filter(|v| !v.is_empty()) {
        metadata.insert("VERSION", version);
    }

    let megabytes = file_size as f64 / (1024.0 * 1024.0);
    metadata.insert("FILE_SIZE_MB", MetaValue::Float((megabytes * 100.0).round() / 100.0));
    metadata
}
