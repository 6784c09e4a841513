use genapply_core::{
    AppConfig, ApplyResult, CancellationToken, ErrorClass, EventSink, FileAction, FileRecord,
    ProgressEvent,
};
use genapply_extract::PackageInferer;
use genapply_policy::{PathNormalizer, PathPolicy, PolicyError, structural_check};
use std::collections::HashMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

mod request;

pub use request::{ApplyRequest, ApplyRequestBody, ApplySource};

/// A request rejected as a whole before any file is touched.
#[derive(thiserror::Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    #[error("malformed request body: {0}")]
    MalformedBody(String),
    #[error("request must contain files or generatedCode")]
    MissingInput,
    #[error("generated code contains no file blocks")]
    NoFileBlocks,
    #[error("no files to apply")]
    EmptyBatch,
    #[error("batch of {count} files exceeds the limit of {max}")]
    TooManyFiles { count: usize, max: usize },
    #[error("files[{index}] ({path}): {source}")]
    InvalidPath {
        index: usize,
        path: String,
        source: PolicyError,
    },
}

impl ValidationError {
    pub fn class(&self) -> ErrorClass {
        ErrorClass::Validation
    }
}

/// What happened to one record of a batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FileOutcome {
    Created(String),
    Updated(String),
    /// A later record in the same batch targets the same path.
    Skipped(String),
    Failed {
        path: String,
        reason: String,
        class: ErrorClass,
    },
}

impl FileOutcome {
    pub fn path(&self) -> &str {
        match self {
            Self::Created(path) | Self::Updated(path) | Self::Skipped(path) => path,
            Self::Failed { path, .. } => path,
        }
    }

    fn record(&self, result: &mut ApplyResult) {
        match self {
            Self::Created(path) => result.files_created.push(path.clone()),
            Self::Updated(path) => result.files_updated.push(path.clone()),
            Self::Skipped(path) => result.files_skipped.push(path.clone()),
            Self::Failed { path, reason, .. } => result.errors.push(format!("{path}: {reason}")),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ApplyReport {
    pub result: ApplyResult,
    pub outcomes: Vec<FileOutcome>,
    /// The caller went away before every file was processed.
    pub cancelled: bool,
}

/// Writes batches of file records under one project root, one file at a
/// time, reporting each step to an [`EventSink`].
#[derive(Debug, Clone)]
pub struct ApplyEngine {
    root: PathBuf,
    normalizer: PathNormalizer,
    policy: PathPolicy,
    inferer: PackageInferer,
    max_batch_files: usize,
    max_path_len: usize,
}

struct PlannedFile<'a> {
    display: String,
    verdict: Result<String, PolicyError>,
    superseded: bool,
    content: &'a str,
}

impl ApplyEngine {
    pub fn new(root: impl Into<PathBuf>, cfg: &AppConfig) -> Self {
        Self {
            root: root.into(),
            normalizer: PathNormalizer::new(&cfg.apply),
            policy: PathPolicy::new(&cfg.policy),
            inferer: PackageInferer::from_config(&cfg.apply),
            max_batch_files: cfg.apply.max_batch_files,
            max_path_len: cfg.apply.max_path_len,
        }
    }

    pub fn validate_batch(&self, files: &[FileRecord]) -> Result<(), ValidationError> {
        if files.is_empty() {
            return Err(ValidationError::EmptyBatch);
        }
        if files.len() > self.max_batch_files {
            return Err(ValidationError::TooManyFiles {
                count: files.len(),
                max: self.max_batch_files,
            });
        }
        for (index, file) in files.iter().enumerate() {
            structural_check(&file.path, self.max_path_len).map_err(|source| {
                ValidationError::InvalidPath {
                    index,
                    path: file.path.clone(),
                    source,
                }
            })?;
        }
        Ok(())
    }

    /// Validates the batch, then processes it in input order.
    ///
    /// A validation failure emits exactly one `error` event and nothing else.
    /// Otherwise the stream is `status`, per-file events, then one `complete`.
    /// A fired `cancel` ends it with one `error` instead; a closed sink gets
    /// nothing further.
    pub fn apply(
        &self,
        request: &ApplyRequest,
        sink: &dyn EventSink,
        cancel: &CancellationToken,
    ) -> Result<ApplyReport, ValidationError> {
        if let Err(err) = self.validate_batch(&request.files) {
            tracing::warn!(error = %err, "apply batch rejected");
            sink.emit(ProgressEvent::error(err.to_string()));
            return Err(err);
        }

        let total = request.files.len();
        sink.emit(ProgressEvent::status(format!("Applying {total} file(s)")));

        let plan = self.plan(&request.files);
        let mut result = ApplyResult::default();
        let mut outcomes = Vec::with_capacity(total);
        let mut cancelled = false;

        for (index, planned) in plan.iter().enumerate() {
            if sink.is_closed() || cancel.is_cancelled() {
                cancelled = true;
                break;
            }
            let current = index + 1;
            sink.emit(ProgressEvent::FileProgress {
                file_name: planned.display.clone(),
                action: FileAction::Validating,
                current,
                total,
            });

            let outcome = if planned.superseded {
                FileOutcome::Skipped(planned.display.clone())
            } else {
                match &planned.verdict {
                    Ok(path) => self.write_one(path, planned.content, sink, current, total),
                    Err(err) => FileOutcome::Failed {
                        path: planned.display.clone(),
                        reason: err.to_string(),
                        class: err.class(),
                    },
                }
            };

            match &outcome {
                FileOutcome::Created(path) | FileOutcome::Updated(path) => {
                    let action = if matches!(outcome, FileOutcome::Created(_)) {
                        FileAction::Creating
                    } else {
                        FileAction::Updating
                    };
                    sink.emit(ProgressEvent::FileComplete {
                        file_name: path.clone(),
                        action,
                        current,
                        total,
                    });
                }
                FileOutcome::Skipped(path) => sink.emit(ProgressEvent::FileComplete {
                    file_name: path.clone(),
                    action: FileAction::Skipped,
                    current,
                    total,
                }),
                FileOutcome::Failed { path, reason, class } => {
                    tracing::warn!(path = %path, reason = %reason, class = ?class, "file not applied");
                    sink.emit(ProgressEvent::FileError {
                        file_name: path.clone(),
                        error: reason.clone(),
                        current,
                        total,
                    });
                }
            }
            outcome.record(&mut result);
            outcomes.push(outcome);
        }

        result.packages = match &request.packages {
            Some(packages) => packages.clone(),
            None => self.inferer.infer(&request.files),
        };

        if cancelled {
            if !sink.is_closed() {
                sink.emit(ProgressEvent::error("request cancelled"));
            }
        } else {
            let summary = result.summary(total);
            let mut message = format!("Applied {} of {} file(s)", summary.succeeded, total);
            if summary.failed > 0 {
                message.push_str(&format!(", {} failed", summary.failed));
            }
            if summary.skipped > 0 {
                message.push_str(&format!(", {} skipped", summary.skipped));
            }
            sink.emit(ProgressEvent::apply_complete(message, result.clone(), total));
        }

        Ok(ApplyReport {
            result,
            outcomes,
            cancelled,
        })
    }

    /// Normalizes and classifies every record up front so that duplicate
    /// targets can be detected. Only the last record for a path is written.
    fn plan<'a>(&self, files: &'a [FileRecord]) -> Vec<PlannedFile<'a>> {
        let mut plan: Vec<PlannedFile<'a>> = files
            .iter()
            .map(|file| {
                let normalized = self.normalizer.normalize(&file.path);
                let verdict = self.policy.classify(&normalized);
                let display = verdict.as_ref().map_or(normalized.clone(), Clone::clone);
                PlannedFile {
                    display,
                    verdict,
                    superseded: false,
                    content: &file.content,
                }
            })
            .collect();

        let mut last_index: HashMap<String, usize> = HashMap::new();
        for (index, planned) in plan.iter().enumerate() {
            if let Ok(path) = &planned.verdict {
                last_index.insert(path.clone(), index);
            }
        }
        for (index, planned) in plan.iter_mut().enumerate() {
            if let Ok(path) = &planned.verdict {
                planned.superseded = last_index.get(path) != Some(&index);
            }
        }
        plan
    }

    fn write_one(
        &self,
        path: &str,
        content: &str,
        sink: &dyn EventSink,
        current: usize,
        total: usize,
    ) -> FileOutcome {
        let target = self.root.join(path);
        let failed = |err: io::Error| FileOutcome::Failed {
            path: path.to_string(),
            reason: err.to_string(),
            class: ErrorClass::IoFailure,
        };

        if let Err(err) = self.check_contained(&target) {
            return failed(err);
        }

        // Advisory only: a concurrent writer can change the answer before the
        // write below.
        let existed = match fs::metadata(&target) {
            Ok(meta) if meta.is_dir() => {
                return failed(io::Error::other("target is a directory"));
            }
            Ok(_) => true,
            Err(err) if err.kind() == io::ErrorKind::NotFound => false,
            Err(err) => return failed(err),
        };

        sink.emit(ProgressEvent::FileProgress {
            file_name: path.to_string(),
            action: if existed {
                FileAction::Updating
            } else {
                FileAction::Creating
            },
            current,
            total,
        });

        match self.write_contents(&target, content) {
            Ok(()) if existed => FileOutcome::Updated(path.to_string()),
            Ok(()) => FileOutcome::Created(path.to_string()),
            Err(err) => failed(err),
        }
    }

    /// Rejects a target that is itself a symlink, or whose deepest existing
    /// ancestor resolves outside the root. Runs before any directory is
    /// created.
    fn check_contained(&self, target: &Path) -> io::Result<()> {
        match fs::symlink_metadata(target) {
            Ok(meta) if meta.file_type().is_symlink() => {
                return Err(io::Error::other("target is a symbolic link"));
            }
            Ok(_) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(err) => return Err(err),
        }
        let root = fs::canonicalize(&self.root)?;
        let ancestor = target
            .ancestors()
            .skip(1)
            .find_map(|dir| fs::canonicalize(dir).ok())
            .ok_or_else(|| io::Error::other("no existing ancestor"))?;
        if !ancestor.starts_with(&root) {
            return Err(io::Error::other("resolves outside the project root"));
        }
        Ok(())
    }

    fn write_contents(&self, target: &Path, content: &str) -> io::Result<()> {
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
            let root = fs::canonicalize(&self.root)?;
            if !fs::canonicalize(parent)?.starts_with(&root) {
                return Err(io::Error::other("resolves outside the project root"));
            }
        }
        fs::write(target, content)
    }
}
