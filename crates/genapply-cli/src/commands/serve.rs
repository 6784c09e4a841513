use anyhow::Result;
use genapply_core::AppConfig;
use genapply_llm::HttpProviderRegistry;
use genapply_server::{AppState, PlatformCommandRunner};
use std::sync::Arc;

use crate::ServeArgs;
use crate::output::workspace_or_cwd;

pub(crate) fn run_serve(args: ServeArgs) -> Result<()> {
    let workspace = workspace_or_cwd(args.workspace)?;
    let cfg = AppConfig::load(&workspace)?;
    let bind = args.bind.unwrap_or_else(|| cfg.server.bind.clone());
    tracing::info!(workspace = %workspace.display(), %bind, "starting genapply server");
    let state = AppState::new(
        workspace,
        cfg,
        Arc::new(HttpProviderRegistry),
        Arc::new(PlatformCommandRunner),
    )?;
    let runtime = tokio::runtime::Runtime::new()?;
    runtime.block_on(genapply_server::serve(state, &bind))
}
