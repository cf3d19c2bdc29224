// Local staging files: unique names, header handling, concatenation

use std::fs::File;
use std::io::{self, BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Header prefix written by the batch engine's export command
pub const FIELD_MARKER: &str = "#Field:";

/// `<dir>/<stem>_<uuid>.<ext>`; unique per call so concurrent runs in one
/// working directory never share a file.
pub fn unique_path(dir: &Path, stem: &str, ext: &str) -> PathBuf {
    dir.join(unique_name(stem, ext))
}

pub fn unique_name(stem: &str, ext: &str) -> String {
    format!("{}_{}.{}", stem, Uuid::new_v4().simple(), ext)
}

/// Remove `marker` from the first line of a file in place
pub fn strip_header_marker(path: &Path, marker: &str) -> io::Result<()> {
    let content = std::fs::read_to_string(path)?;
    std::fs::write(path, strip_header_marker_str(&content, marker))
}

pub fn strip_header_marker_str(content: &str, marker: &str) -> String {
    let (first, rest) = match content.find('\n') {
        Some(index) => content.split_at(index),
        None => (content, ""),
    };
    format!("{}{}", first.replacen(marker, "", 1).trim_start(), rest)
}

/// Column names from the header line of a delimited-text file
pub fn read_header(path: &Path) -> Result<Vec<String>, csv::Error> {
    let mut reader = csv::ReaderBuilder::new()
        .has_headers(true)
        .from_path(path)?;
    Ok(reader
        .headers()?
        .iter()
        .map(|h| h.trim().to_string())
        .collect())
}

/// Concatenate parts into `output`: the first in full, the rest without
/// their first line.
///
/// Headers are not compared: callers guarantee every part shares one schema.
/// A part whose last row has no line terminator is closed with `\n` before
/// the next part's rows are written.
pub fn concat_files(parts: &[PathBuf], output: &Path) -> io::Result<()> {
    let mut writer = BufWriter::new(File::create(output)?);
    let mut line_open = false;

    for (index, part) in parts.iter().enumerate() {
        let mut reader = BufReader::new(File::open(part)?);
        if index > 0 {
            let mut header = String::new();
            reader.read_line(&mut header)?;
        }

        let mut part_start = true;
        loop {
            let chunk = reader.fill_buf()?;
            if chunk.is_empty() {
                break;
            }
            if part_start && line_open {
                writer.write_all(b"\n")?;
            }
            part_start = false;

            writer.write_all(chunk)?;
            line_open = !chunk.ends_with(b"\n");
            let len = chunk.len();
            reader.consume(len);
        }
    }

    writer.flush()
}

/// Delete a local file; a file that is already gone counts as removed
pub fn remove_file(path: &Path) -> io::Result<()> {
    match std::fs::remove_file(path) {
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        other => other,
    }
}

pub fn count_lines(path: &Path) -> io::Result<usize> {
    Ok(BufReader::new(File::open(path)?).lines().count())
}
