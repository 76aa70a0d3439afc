use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use crate::rotation::RotationResult;
use crate::settings::OutputSettings;

#[derive(Debug, thiserror::Error)]
#[error("Failed to write step outputs to {path}: {source}")]
pub struct OutputError {
    pub path: PathBuf,
    #[source]
    pub source: std::io::Error,
}

/// Writes CI step outputs as `key=value` lines
///
/// Plain and sensitive values go to separate files so the CI system can
/// redact the latter.
pub struct OutputWriter {
    path: PathBuf,
    secret_path: PathBuf,
}

impl OutputWriter {
    pub fn new(settings: &OutputSettings) -> Self {
        Self {
            path: settings.path.clone(),
            secret_path: settings.secret_path.clone(),
        }
    }

    pub fn write(&self, result: &RotationResult) -> Result<(), OutputError> {
        write_outputs(
            &self.path,
            &[
                ("created_token", result.token_secret_name.as_str()),
                ("updated_secret", result.secret_identifier.as_str()),
            ],
        )?;
        write_outputs(&self.secret_path, &[("token", result.token.as_str())])
    }
}

fn write_outputs(path: &Path, outputs: &[(&str, &str)]) -> Result<(), OutputError> {
    let wrap = |source: std::io::Error| OutputError {
        path: path.to_path_buf(),
        source,
    };

    let mut file = fs::File::create(path).map_err(wrap)?;
    for (key, value) in outputs {
        writeln!(file, "{}={}", key, value).map_err(wrap)?;
    }
    file.flush().map_err(wrap)
}
