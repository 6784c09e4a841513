use anyhow::{Result, anyhow};
use genapply_apply::{ApplyEngine, ApplyRequest};
use genapply_core::{AppConfig, CancellationToken, ProgressEvent};
use genapply_extract::FileBlockParser;

use crate::ApplyArgs;
use crate::output::{print_json, read_input, workspace_or_cwd};

/// Prints every progress event as one JSON line.
pub(crate) fn run_apply(args: ApplyArgs) -> Result<()> {
    let workspace = workspace_or_cwd(args.workspace)?;
    let cfg = AppConfig::load(&workspace)?;
    let text = read_input(&args.file)?;
    let engine = ApplyEngine::new(workspace, &cfg);

    let sink = |event: ProgressEvent| {
        if let Err(err) = print_json(&event) {
            tracing::warn!(error = %err, "failed to print event");
        }
    };
    let request = match ApplyRequest::from_text(&text, &FileBlockParser::new()) {
        Ok(request) => request,
        Err(err) => {
            sink(ProgressEvent::error(err.to_string()));
            return Err(err.into());
        }
    };
    let report = engine.apply(&request, &sink, &CancellationToken::new())?;
    let failed = report.result.errors.len();
    if failed > 0 {
        return Err(anyhow!("{failed} file(s) were not applied"));
    }
    Ok(())
}
