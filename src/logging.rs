//! Diagnostics setup and the conversation transcript writer.
//!
//! Transcripts are plain-text files stored in XDG_DATA_HOME/portal-chat/logs/
//! with the structure logs/server/conversation/YYYY-MM-DD.log, one line per
//! message. Writes happen on a background thread so routing never blocks on
//! disk.

use std::collections::HashMap;
use std::fs::{self, File, OpenOptions};
use std::io::{self, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::thread;

use chrono::{DateTime, FixedOffset, Utc};
use crossbeam_channel::{unbounded, Receiver, Sender};
use tracing_subscriber::EnvFilter;

/// Install the `tracing` subscriber. `RUST_LOG` overrides the default
/// `portal_chat=info` filter.
pub fn init_tracing() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("portal_chat=info"));
    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(io::stderr)
        .try_init();
}

/// A transcript line to be written to disk
#[derive(Debug, Clone)]
pub struct TranscriptEntry {
    pub server: String,
    pub conversation: String,
    pub created_at: DateTime<Utc>,
    pub nick: String,
    pub message: String,
}

/// Appends transcripts without blocking the caller
pub struct TranscriptLogger {
    tx: Sender<TranscriptEntry>,
}

impl TranscriptLogger {
    /// Logger rooted in the platform data directory.
    pub fn new(offset: FixedOffset) -> io::Result<Self> {
        Self::with_directory(transcript_directory()?, offset)
    }

    /// Logger rooted in `log_dir`; lines and file dates use `offset`.
    pub fn with_directory(log_dir: PathBuf, offset: FixedOffset) -> io::Result<Self> {
        fs::create_dir_all(&log_dir)?;

        let (tx, rx) = unbounded::<TranscriptEntry>();
        thread::Builder::new()
            .name("transcripts".into())
            .spawn(move || run_writer_thread(rx, log_dir, offset))?;

        Ok(Self { tx })
    }

    /// Queue an entry (non-blocking)
    pub fn log(&self, entry: TranscriptEntry) {
        // A closed channel means the writer thread is gone; nothing to do.
        let _ = self.tx.send(entry);
    }
}

fn run_writer_thread(rx: Receiver<TranscriptEntry>, log_dir: PathBuf, offset: FixedOffset) {
    // Open files keyed by relative path
    let mut files: HashMap<PathBuf, BufWriter<File>> = HashMap::new();

    while let Ok(entry) = rx.recv() {
        if let Err(e) = write_entry(&mut files, &log_dir, offset, &entry) {
            tracing::warn!(conversation = %entry.conversation, "transcript write failed: {}", e);
        }
    }

    for (_, mut writer) in files.drain() {
        let _ = writer.flush();
    }
}

fn write_entry(
    files: &mut HashMap<PathBuf, BufWriter<File>>,
    log_dir: &Path,
    offset: FixedOffset,
    entry: &TranscriptEntry,
) -> io::Result<()> {
    let local = entry.created_at.with_timezone(&offset);
    let relative = transcript_path(&entry.server, &entry.conversation, &local.format("%Y-%m-%d").to_string());

    let writer = match files.entry(relative) {
        std::collections::hash_map::Entry::Occupied(slot) => slot.into_mut(),
        std::collections::hash_map::Entry::Vacant(slot) => {
            let full = log_dir.join(slot.key());
            if let Some(parent) = full.parent() {
                fs::create_dir_all(parent)?;
            }
            let file = OpenOptions::new().create(true).append(true).open(&full)?;
            slot.insert(BufWriter::new(file))
        }
    };

    // Format: [HH:MM:SS] <nick> message
    writeln!(
        writer,
        "[{}] <{}> {}",
        local.format("%H:%M:%S"),
        entry.nick,
        entry.message.replace('\n', " ")
    )?;
    writer.flush()
}

/// Relative path of a transcript file.
fn transcript_path(server: &str, conversation: &str, date: &str) -> PathBuf {
    PathBuf::from(sanitize_filename(server))
        .join(sanitize_filename(conversation))
        .join(format!("{}.log", date))
}

fn transcript_directory() -> io::Result<PathBuf> {
    let base = directories::BaseDirs::new()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "no home directory"))?;
    Ok(base.data_dir().join("portal-chat").join("logs"))
}

/// Sanitize a path component to be filesystem-safe
fn sanitize_filename(name: &str) -> String {
    name.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            _ => c,
        })
        .collect()
}
