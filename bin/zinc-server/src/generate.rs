//! Test fixture generation
//!
//! Writes a datastore file filled with random entries, committed as a
//! single transaction.

use clap::ValueEnum;
use rand::Rng;
use rand::distributions::Alphanumeric;
use std::fs;
use std::path::PathBuf;
use std::time::Duration;
use tracing::info;
use zinc_common::{Error, Result};
use zinc_storage::{DataFormat, DatastoreOperations, Entry, WriteOptions, serialize_entries};

/// Format of generated keys and values
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, ValueEnum)]
pub enum EntryType {
    Binary,
    Utf8,
    #[default]
    Json,
}

#[derive(Debug, Clone)]
pub struct GenerateOptions {
    pub path: PathBuf,
    pub entry_count: usize,
    pub key_size: usize,
    pub value_size: usize,
    pub entry_type: EntryType,
}

impl GenerateOptions {
    fn validate(&self) -> Result<()> {
        if self.entry_count == 0 {
            return Err(Error::validation("entry count must be positive"));
        }
        // JSON keys and values are quoted strings
        let min = if self.entry_type == EntryType::Json { 2 } else { 1 };
        if self.key_size < min || self.key_size > usize::from(u16::MAX) {
            return Err(Error::validation(format!(
                "key size must be between {min} and {}",
                u16::MAX
            )));
        }
        if self.entry_type == EntryType::Json && self.value_size < 2 {
            return Err(Error::validation("JSON value size must be at least 2"));
        }
        Ok(())
    }
}

fn random_text(rng: &mut impl Rng, len: usize) -> String {
    (0..len).map(|_| char::from(rng.sample(Alphanumeric))).collect()
}

fn random_bytes(rng: &mut impl Rng, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    rng.fill(buf.as_mut_slice());
    buf
}

fn random_json_string(rng: &mut impl Rng, len: usize) -> String {
    format!("\"{}\"", random_text(rng, len - 2))
}

fn random_entry(rng: &mut impl Rng, options: &GenerateOptions) -> Entry {
    match options.entry_type {
        EntryType::Binary => Entry::new(
            random_bytes(rng, options.key_size),
            DataFormat::Binary,
            random_bytes(rng, options.value_size),
            DataFormat::Binary,
        ),
        EntryType::Utf8 => Entry::new(
            random_text(rng, options.key_size),
            DataFormat::Utf8,
            random_text(rng, options.value_size),
            DataFormat::Utf8,
        ),
        EntryType::Json => Entry::json(
            random_json_string(rng, options.key_size),
            random_json_string(rng, options.value_size),
        ),
    }
}

/// Write the datastore at `options.path`, replacing any existing content.
/// Returns the resulting file size.
pub fn generate(options: &GenerateOptions) -> Result<u64> {
    options.validate()?;

    if let Some(parent) = options.path.parent()
        && !parent.as_os_str().is_empty()
    {
        fs::create_dir_all(parent)?;
    }
    let name = options
        .path
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or("generated");
    let ops = DatastoreOperations::new(name, &options.path, false);
    ops.create_if_missing()?;

    let mut rng = rand::thread_rng();
    let entries: Vec<Entry> = (0..options.entry_count)
        .map(|_| random_entry(&mut rng, options))
        .collect();
    let write_options = WriteOptions {
        flush: true,
        max_flush_delay: Duration::ZERO,
        max_size: None,
        max_entry_size: None,
    };
    let commit_time = ops.rewrite_transaction(serialize_entries(&entries), &write_options)?;

    let size = ops.load_if_needed()?.total_size();
    info!(
        "Generated {} entries in {} ({} bytes, committed at {})",
        options.entry_count,
        options.path.display(),
        size,
        commit_time
    );
    Ok(size)
}
