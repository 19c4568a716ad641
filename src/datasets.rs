use anyhow::Result;

use crate::config::{Config, DatasetConfig};
use crate::models::KeywordSet;

/// Where the items of a dataset are read from, for listings.
fn origin(dataset: &DatasetConfig) -> String {
    match &dataset.tap {
        Some(tap) => format!("{} ({})", tap.service_url, tap.table),
        None => dataset
            .base_file_url
            .clone()
            .or_else(|| {
                dataset
                    .base_file_path
                    .as_ref()
                    .map(|p| p.display().to_string())
            })
            .unwrap_or_else(|| "-".to_string()),
    }
}

pub fn list_datasets(config: &Config) -> Result<()> {
    if config.datasets.is_empty() {
        println!("No datasets configured.");
        return Ok(());
    }

    println!("{:<16} {:<24} {:<10} ORIGIN", "KEY", "NAME", "SOURCE");
    for (key, dataset) in &config.datasets {
        println!(
            "{:<16} {:<24} {:<10} {}",
            key,
            dataset.name,
            dataset.source.as_str(),
            origin(dataset)
        );
    }

    Ok(())
}

pub fn print_keywords(dataset: &str, keywords: &KeywordSet) {
    println!("{} keywords for {}", keywords.len(), dataset);
    println!(
        "{:<20} {:<20} {:<16} {:<12} DESCRIPTION",
        "NAME", "VERBOSE NAME", "TYPE", "UNIT"
    );
    for keyword in keywords.iter() {
        println!(
            "{:<20} {:<20} {:<16} {:<12} {}",
            keyword.name,
            keyword.verbose_name,
            keyword.keyword_type.as_str(),
            keyword.unit.as_deref().unwrap_or("-"),
            keyword.description.as_deref().unwrap_or("")
        );
    }
}
