//! Capture output file rotation.
//!
//! Long recordings are split across a numbered (or time-templated) sequence
//! of files. The first numbered file keeps the requested name until the
//! first rotation, at which point it is renamed to carry the `-01` suffix.

use std::fs::{self, File, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::{Path, PathBuf};

use chrono::format::{Item, StrftimeItems};
use chrono::Local;

use crate::error::{EngineError, Result};
use crate::format::StreamFormat;
use crate::signal::SignalFlags;

/// When and how capture files rotate.
#[derive(Clone, Debug, Default)]
pub struct RotationPolicy {
    /// Rotate after this many seconds of audio per file; 0 never rotates on
    /// size (the external rotate signal still works).
    pub max_file_seconds: u64,
    /// Treat the output name as a strftime-style template, re-evaluated per
    /// file. `%v` expands to the 1-based file index, zero-padded to two
    /// digits.
    pub time_template: bool,
}

impl RotationPolicy {
    /// Size threshold in bytes for one file, derived from the byte rate.
    pub fn threshold_bytes(&self, format: &StreamFormat) -> u64 {
        self.max_file_seconds * format.byte_rate()
    }
}

/// The ordered set of files one capture run writes into.
pub struct CaptureFileSet {
    original: PathBuf,
    time_template: bool,
    threshold_bytes: u64,
    file: Option<File>,
    file_count: usize,
    bytes_written: u64,
    written_names: Vec<PathBuf>,
}

impl CaptureFileSet {
    /// Open the first output file.
    pub fn create(
        original: PathBuf,
        policy: &RotationPolicy,
        format: &StreamFormat,
    ) -> Result<Self> {
        let mut set = Self {
            original,
            time_template: policy.time_template,
            threshold_bytes: policy.threshold_bytes(format),
            file: None,
            file_count: 0,
            bytes_written: 0,
            written_names: Vec::new(),
        };
        set.open_next()?;
        Ok(set)
    }

    pub fn current_name(&self) -> &Path {
        self.written_names.last().expect("at least one file open")
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Whether the size threshold or the external rotate request fired.
    ///
    /// Consumes a pending rotate request.
    pub fn should_rotate(&self, signals: &SignalFlags) -> bool {
        if signals.take_rotate() {
            return true;
        }
        self.threshold_bytes > 0 && self.bytes_written >= self.threshold_bytes
    }

    /// Close the current file and open the next one in the sequence.
    pub fn rotate(&mut self) -> Result<()> {
        self.file.take();
        self.open_next()
    }

    /// Append captured bytes to the current file.
    pub fn write(&mut self, data: &[u8]) -> Result<()> {
        let file = self.file.as_mut().expect("capture file open");
        file.write_all(data)
            .map_err(|e| EngineError::io(self.written_names.last().unwrap(), e))?;
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    /// Close the set and return every file name written, in order.
    pub fn finish(self) -> Vec<PathBuf> {
        self.written_names
    }

    /// Compute the next file name, renaming the original on the first
    /// rotation of a numbered sequence.
    fn next_name(&mut self) -> Result<PathBuf> {
        if self.time_template {
            let template = self.original.to_string_lossy();
            return Ok(PathBuf::from(format_time_template(
                &template,
                self.file_count + 1,
            )?));
        }

        let (base, ext) = split_base_ext(&self.original);
        if self.file_count == 1 {
            let renamed = numbered_name(&base, ext.as_deref(), 1);
            let _ = fs::remove_file(&renamed);
            fs::rename(&self.original, &renamed)
                .map_err(|e| EngineError::io(&self.original, e))?;
            if let Some(first) = self.written_names.first_mut() {
                *first = renamed;
            }
            self.file_count = 2;
        }
        Ok(numbered_name(&base, ext.as_deref(), self.file_count))
    }

    fn open_next(&mut self) -> Result<()> {
        let name = if self.file_count == 0 && !self.time_template {
            self.original.clone()
        } else {
            self.next_name()?
        };

        // Replace a pre-existing regular file; leave anything else alone.
        if let Ok(meta) = fs::symlink_metadata(&name) {
            if meta.is_file() {
                let _ = fs::remove_file(&name);
            }
        }

        let file = match OpenOptions::new().write(true).create(true).open(&name) {
            Ok(file) => file,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                // Templates can introduce directories that don't exist yet.
                if let Some(parent) = name.parent() {
                    fs::create_dir_all(parent).map_err(|e| EngineError::io(parent, e))?;
                }
                OpenOptions::new()
                    .write(true)
                    .create(true)
                    .open(&name)
                    .map_err(|e| EngineError::io(&name, e))?
            }
            Err(e) => return Err(EngineError::io(&name, e)),
        };

        tracing::info!(file = %name.display(), "capture file opened");
        self.file = Some(file);
        self.file_count += 1;
        self.bytes_written = 0;
        self.written_names.push(name);
        Ok(())
    }
}

/// Split a path at the last `.` of its final component.
fn split_base_ext(path: &Path) -> (String, Option<String>) {
    let s = path.to_string_lossy();
    match s.rfind('.') {
        Some(dot) if !s[dot..].contains('/') => {
            (s[..dot].to_string(), Some(s[dot + 1..].to_string()))
        }
        _ => (s.into_owned(), None),
    }
}

fn numbered_name(base: &str, ext: Option<&str>, index: usize) -> PathBuf {
    match ext {
        Some(ext) => PathBuf::from(format!("{base}-{index:02}.{ext}")),
        None => PathBuf::from(format!("{base}-{index:02}")),
    }
}

/// Expand the `%v` file-index escape, then format the remaining strftime
/// specifiers against the current wall-clock time.
fn format_time_template(template: &str, file_number: usize) -> Result<String> {
    let mut expanded = String::with_capacity(template.len());
    let mut chars = template.chars();
    while let Some(c) = chars.next() {
        if c != '%' {
            expanded.push(c);
            continue;
        }
        match chars.next() {
            Some('v') => expanded.push_str(&format!("{file_number:02}")),
            Some(other) => {
                expanded.push('%');
                expanded.push(other);
            }
            None => break,
        }
    }

    let items: Vec<Item<'_>> = StrftimeItems::new(&expanded).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        return Err(EngineError::Config(format!(
            "invalid output name template '{template}'"
        )));
    }
    let name = Local::now().format_with_items(items.into_iter()).to_string();
    if name.is_empty() {
        return Err(EngineError::Config(
            "output name template expands to an empty name".into(),
        ));
    }
    Ok(name)
}
