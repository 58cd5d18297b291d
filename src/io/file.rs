//! Input/Output file handling with [`InputStream`] and [`OutputStream`].
//!
//! These types abstract over reading/writing both plaintext and gzip-compressed
//! input/output.

use flate2::read::GzDecoder;
use flate2::write::GzEncoder;
use flate2::Compression;
use indexmap::IndexMap;
use std::fs::File;
use std::io::Write;
use std::io::{self, BufWriter};
use std::io::{BufRead, BufReader, Read};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;
use tempfile::NamedTempFile;
use tracing::warn;

use crate::error::BasenjiError;
use crate::Position;

/// Read a tab-delimited *genome file* of sequence (i.e. chromosome) names and their lengths.
pub fn read_seqlens(
    filepath: impl Into<PathBuf>,
) -> Result<IndexMap<String, Position>, BasenjiError> {
    let input_file = InputStream::new(filepath);
    let reader = input_file.reader()?;

    let mut seqlens = IndexMap::new();
    for result in reader.lines() {
        let line = result?;
        if line.trim().is_empty() || line.starts_with('#') {
            continue;
        }
        let mut columns = line.split('\t');
        let seqname = columns.next().unwrap_or_default();
        let length: Position = columns
            .next()
            .ok_or_else(|| {
                BasenjiError::InvalidGenomeFile(format!("line '{}' has no length column", line))
            })?
            .trim()
            .parse()?;
        if seqlens.contains_key(seqname) {
            return Err(BasenjiError::InvalidGenomeFile(format!(
                "sequence '{}' is duplicated",
                seqname
            )));
        }
        seqlens.insert(seqname.to_string(), length);
    }
    Ok(seqlens)
}

/// Check if a file is a gzipped by looking for the magic numbers
pub fn is_gzipped_file(file_path: impl AsRef<Path>) -> io::Result<bool> {
    let mut file = File::open(file_path.as_ref())?;
    let mut buffer = [0; 2];
    match file.read_exact(&mut buffer) {
        Ok(()) => Ok(buffer == [0x1f, 0x8b]),
        // files shorter than the magic number are plaintext
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => Ok(false),
        Err(e) => Err(e),
    }
}

/// The delay before the first retry of a failed write; it doubles on every attempt.
pub const RETRY_BASE_DELAY: Duration = Duration::from_millis(20);

/// Run a write operation on `filepath`, retrying it up to `retries` times with
/// exponential backoff.
///
/// # Errors
/// Returns [`BasenjiError::PersistenceFailed`] with the last I/O error once all attempts
/// have failed.
pub fn with_retries<T>(
    filepath: &Path,
    retries: usize,
    mut operation: impl FnMut() -> io::Result<T>,
) -> Result<T, BasenjiError> {
    let mut delay = RETRY_BASE_DELAY;
    let mut attempts = 0;
    loop {
        attempts += 1;
        match operation() {
            Ok(value) => return Ok(value),
            Err(source) if attempts > retries => {
                return Err(BasenjiError::PersistenceFailed {
                    path: filepath.display().to_string(),
                    attempts,
                    source,
                })
            }
            Err(e) => {
                warn!(path = %filepath.display(), attempt = attempts, error = %e, "write failed, retrying");
                thread::sleep(delay);
                delay *= 2;
            }
        }
    }
}

/// Write `bytes` to `filepath` through a temporary file in the same directory, renamed
/// into place once complete; readers never see a partially written file.
pub fn write_atomic(filepath: &Path, bytes: &[u8]) -> io::Result<()> {
    let dir = filepath
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    let mut temp = NamedTempFile::new_in(dir)?;
    temp.write_all(bytes)?;
    temp.as_file().sync_all()?;
    temp.persist(filepath).map_err(|e| e.error)?;
    Ok(())
}

/// Represents an input file.
///
/// This abstracts how data is read in, allowing for both plaintext and gzip-compressed input
/// to be read through a common interface.
#[derive(Clone, Debug)]
pub struct InputStream {
    pub filepath: PathBuf,
}

impl InputStream {
    /// Constructs a new `InputStream`.
    ///
    /// # Arguments
    ///
    /// * `filepath` - The path to the file. Gzip-compressed input is detected from the
    ///   magic number and uncompressed automatically.
    pub fn new(filepath: impl Into<PathBuf>) -> Self {
        Self {
            filepath: filepath.into(),
        }
    }

    /// Opens the file and returns a buffered reader.
    pub fn reader(&self) -> io::Result<BufReader<Box<dyn Read>>> {
        let file = File::open(&self.filepath)?;
        let is_gzipped = is_gzipped_file(&self.filepath)?;
        let reader: Box<dyn Read> = if is_gzipped {
            Box::new(GzDecoder::new(file))
        } else {
            Box::new(file)
        };
        Ok(BufReader::new(reader))
    }
}

enum OutputDestination {
    File(PathBuf),
    Stdout,
}

/// Represents an output file.
///
/// This abstracts writing both plaintext and gzip-compressed files, or standard output.
pub struct OutputStream {
    destination: OutputDestination,
    pub header: Option<Vec<String>>,
}

impl OutputStream {
    /// Constructs a new `OutputStream`.
    ///
    /// # Arguments
    ///
    /// * `filepath` - The path to the file. If the file extension is `.gz`, the output
    ///   is gzip-compressed.
    /// * `header` - Optional commented header lines to be written to the file.
    pub fn new(filepath: impl Into<PathBuf>, header: Option<Vec<String>>) -> Self {
        Self {
            destination: OutputDestination::File(filepath.into()),
            header,
        }
    }

    /// Constructs a new [`OutputStream`] for standard output.
    pub fn new_stdout(header: Option<Vec<String>>) -> Self {
        Self {
            destination: OutputDestination::Stdout,
            header,
        }
    }

    /// Opens the destination and returns a writer, writing the header if one is set.
    pub fn writer(&self) -> io::Result<Box<dyn Write>> {
        let mut writer: Box<dyn Write> = match &self.destination {
            OutputDestination::File(path) => {
                let is_gzip = path.extension().map_or(false, |ext| ext == "gz");
                if is_gzip {
                    Box::new(BufWriter::new(GzEncoder::new(
                        File::create(path)?,
                        Compression::default(),
                    )))
                } else {
                    Box::new(BufWriter::new(File::create(path)?))
                }
            }
            OutputDestination::Stdout => Box::new(BufWriter::new(io::stdout())),
        };
        if let Some(entries) = &self.header {
            for entry in entries {
                writeln!(writer, "#{}", entry)?;
            }
        }
        Ok(writer)
    }
}
