use std::io::{self, Write};

use serde::Serialize;

use crate::app::{
    CollectionDownloadResult, CollectionListResult, ConnectResult, DownloadResult,
    FileListResult, InfoResult, ProgressEvent, ProgressSink, SearchHits, SearchResult,
    UploadResult,
};
use crate::config::{ConfigChange, ConfigEntry};
use crate::relations::RelationGraph;

const PREVIEW: usize = 5;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputMode {
    Text,
    Json,
}

pub struct JsonOutput;

impl JsonOutput {
    pub fn print<T: Serialize>(value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(io::Error::other)?;
        let mut stdout = io::stdout();
        stdout.write_all(json.as_bytes())?;
        stdout.write_all(b"\n")?;
        Ok(())
    }
}

impl ProgressSink for JsonOutput {
    fn event(&self, _event: ProgressEvent) {}
}

/// Progress lines on stderr so stdout stays clean for results.
pub struct TextProgress;

impl ProgressSink for TextProgress {
    fn event(&self, event: ProgressEvent) {
        match event.elapsed {
            Some(elapsed) => eprintln!("> {} ({} ms)", event.message, elapsed.as_millis()),
            None => eprintln!("> {}", event.message),
        }
    }
}

pub struct TextOutput;

impl TextOutput {
    pub fn connect(result: &ConnectResult) {
        println!("Connected successfully");
        println!("Found {} spaces", result.space_count);
        for space in &result.spaces {
            println!(
                "  {}: {}",
                space.code,
                space.description.as_deref().unwrap_or("No description")
            );
        }
    }

    pub fn search(result: &SearchResult) {
        println!("Query: {}", result.query);
        let sections = [
            ("experiments", &result.experiments),
            ("samples", &result.samples),
            ("datasets", &result.datasets),
        ];
        for (label, hits) in sections {
            if let Some(hits) = hits {
                Self::hits(label, hits);
            }
        }
        for error in &result.errors {
            println!("Search failed for {error}");
        }
    }

    fn hits(label: &str, hits: &SearchHits) {
        println!("Found {} {label}", hits.total);
        for item in &hits.items {
            println!("  - {} ({})", item.code, item.entity_type);
        }
    }

    pub fn files(result: &FileListResult) {
        println!("Found {} files in {}:", result.files.len(), result.code);
        for file in &result.files {
            match file.size {
                Some(size) => println!("  {} ({size} bytes)", file.path),
                None => println!("  {} (unknown size)", file.path),
            }
        }
    }

    pub fn download(result: &DownloadResult) {
        println!(
            "{}: {} fetched, {} up to date, {} files in {}",
            result.code,
            result.fetched.len(),
            result.skipped.len(),
            result.file_count,
            result.destination
        );
        for file in result.fetched.iter().take(PREVIEW) {
            println!("  fetched {} ({})", file.path, file.reason);
        }
        if result.fetched.len() > PREVIEW {
            println!("  ... and {} more", result.fetched.len() - PREVIEW);
        }
    }

    pub fn collection(result: &CollectionListResult) {
        println!("Found {} datasets in {}", result.total, result.collection);
        for dataset in &result.datasets {
            println!(
                "  {} ({}) - {}",
                dataset.code,
                dataset.entity_type,
                dataset.registration_date.as_deref().unwrap_or("unknown")
            );
        }
        if result.datasets.len() < result.total {
            println!("  ... and {} more datasets", result.total - result.datasets.len());
        }
    }

    pub fn collection_download(result: &CollectionDownloadResult) {
        println!("Collection download summary for {}", result.collection);
        println!("  Successful downloads: {}", result.downloads.len());
        println!("  Failed downloads: {}", result.failures.len());
        println!("  Output directory: {}", result.output_dir);
        for failure in &result.failures {
            println!("  {}: {}", failure.code, failure.error);
        }
    }

    pub fn info(result: &InfoResult) {
        if let Some(spaces) = &result.spaces {
            println!("Total spaces: {}", spaces.len());
            for space in spaces {
                println!("Space: {}", space.code);
                println!(
                    "  Description: {}",
                    space.description.as_deref().unwrap_or("No description")
                );
                match space.projects {
                    Some(count) => println!("  Projects: {count}"),
                    None => println!("  Projects: unable to retrieve"),
                }
            }
        }
        if let Some(dataset) = &result.dataset {
            let info = &dataset.info;
            println!("Code: {}", info.code);
            println!("Type: {}", info.dataset_type);
            println!(
                "Registration Date: {}",
                info.registration_date.as_deref().unwrap_or("N/A")
            );
            for (key, value) in &info.properties {
                println!("  {key}: {value}");
            }
            match &dataset.files {
                Some(files) => {
                    println!("Files: {}", files.len());
                    for file in files.iter().take(PREVIEW) {
                        println!("  {} ({} bytes)", file.path, file.size.unwrap_or(0));
                    }
                    if files.len() > PREVIEW {
                        println!("  ... and {} more files", files.len() - PREVIEW);
                    }
                }
                None => println!("Files: unable to retrieve"),
            }
        }
        if let Some(sample) = &result.sample {
            let info = &sample.info;
            println!("Code: {}", info.code);
            println!("Type: {}", info.sample_type);
            println!(
                "Registration Date: {}",
                info.registration_date.as_deref().unwrap_or("N/A")
            );
            for (key, value) in &info.properties {
                println!("  {key}: {value}");
            }
            match &sample.datasets {
                Some(datasets) => {
                    println!("Related Datasets: {}", datasets.len());
                    for dataset in datasets.iter().take(PREVIEW) {
                        println!("  {} ({})", dataset.code, dataset.entity_type);
                    }
                    if datasets.len() > PREVIEW {
                        println!("  ... and {} more datasets", datasets.len() - PREVIEW);
                    }
                }
                None => println!("Related Datasets: unable to retrieve"),
            }
        }
    }

    pub fn relations(graph: &RelationGraph) {
        println!("Relations of {}", graph.root);
        if graph.edges.is_empty() {
            println!("  none");
        }
        for edge in &graph.edges {
            let indent = "  ".repeat(edge.depth);
            let name = edge
                .record
                .name
                .as_deref()
                .map(|name| format!(" \"{name}\""))
                .unwrap_or_default();
            println!(
                "{indent}{} of {}: {} ({}){name}",
                edge.kind, edge.from, edge.record.code, edge.record.dataset_type
            );
        }
        for key in &graph.unresolved {
            println!("  could not resolve {key}");
        }
    }

    pub fn upload(result: &UploadResult) {
        let plan = &result.plan;
        if result.dry_run {
            println!("Dry run - would upload:");
        }
        println!("  File: {}", plan.file.display());
        println!("  Name: {}", plan.name);
        println!("  Collection: {}", plan.collection);
        println!("  Dataset type: {}", plan.dataset_type);
        if !plan.additional_files.is_empty() {
            println!("  Additional files: {}", plan.additional_files.len());
        }
        println!("  Metadata fields: {}", plan.metadata.len());
        for (key, value) in &plan.properties {
            println!("  {key}: {value}");
        }
        if let Some(code) = &result.dataset_code {
            println!("Dataset ID: {code}");
        }
    }

    pub fn config_entries(entries: &[ConfigEntry]) {
        for entry in entries {
            println!(
                "{} = {} ({})",
                entry.key,
                entry.value.as_deref().unwrap_or("<unset>"),
                entry.source.as_str()
            );
        }
    }

    pub fn config_change(change: &ConfigChange) {
        match (&change.value, change.changed) {
            (Some(value), _) => println!("{} = {value} ({})", change.key, change.path),
            (None, true) => println!("{} removed from {}", change.key, change.path),
            (None, false) => println!("{} was not set in {}", change.key, change.path),
        }
    }
}
