use crate::coverage::CoverageRegistry;
use crate::engine::Engine;
use crate::harness::Harness;
use crate::input::FixedBuffer;
use std::fs::File;
use std::io::{self, Read};
use std::path::{Path, PathBuf};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SingleShotError {
    #[error("failed to open input file {path:?}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: io::Error,
    },
    #[error("input file {path:?} is {size} bytes, limit is {limit}")]
    InputTooLarge {
        path: PathBuf,
        size: u64,
        limit: usize,
    },
    #[error("failed to read input: {0}")]
    Read(#[from] io::Error),
}

/// Where the single input comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SingleShotInput {
    File(PathBuf),
    Stdin,
}

impl From<Option<PathBuf>> for SingleShotInput {
    fn from(path: Option<PathBuf>) -> Self {
        path.map_or(SingleShotInput::Stdin, SingleShotInput::File)
    }
}

/// Loads a whole file, refusing anything that does not fit the buffer.
pub fn load_file(path: &Path, buffer: &mut FixedBuffer) -> Result<usize, SingleShotError> {
    let file = File::open(path).map_err(|source| SingleShotError::Open {
        path: path.to_path_buf(),
        source,
    })?;
    let size = file.metadata()?.len();
    if size > buffer.payload_limit() as u64 {
        return Err(SingleShotError::InputTooLarge {
            path: path.to_path_buf(),
            size,
            limit: buffer.payload_limit(),
        });
    }
    Ok(buffer.fill_from_reader(file)?)
}

/// Reads one input, runs it once and returns the status, which becomes the
/// process exit code.
pub fn run_once<E, R>(
    harness: &mut Harness<E>,
    input: &SingleShotInput,
    stdin: R,
    buffer: &mut FixedBuffer,
    coverage: Option<&CoverageRegistry<'_>>,
) -> Result<i32, SingleShotError>
where
    E: Engine,
    R: Read,
{
    match input {
        SingleShotInput::File(path) => {
            load_file(path, buffer)?;
        }
        SingleShotInput::Stdin => {
            buffer.fill_from_reader(stdin)?;
        }
    }
    tracing::debug!(bytes = buffer.len(), source = ?input, "input loaded");

    let status = harness.run(buffer.as_bytes());

    if let Some(tracker) = coverage.and_then(|registry| registry.tracker()) {
        tracing::info!(
            covered = tracker.covered_edges().len(),
            tracked = tracker.tracked_edges(),
            "coverage after execution"
        );
    }
    Ok(status)
}
