use anyhow::Result;
use genapply_core::AppConfig;
use genapply_extract::{FileBlockParser, PackageInferer};
use serde_json::json;

use crate::ExtractArgs;
use crate::output::{print_json, read_input};

pub(crate) fn run_extract(args: ExtractArgs) -> Result<()> {
    let text = read_input(&args.file)?;
    let cfg = AppConfig::load(&std::env::current_dir()?)?;
    let extraction = FileBlockParser::new().extract(&text);
    let packages = PackageInferer::from_config(&cfg.apply).infer(&extraction.files);
    print_json(&json!({
        "files": extraction.files,
        "explanation": extraction.explanation,
        "packages": packages,
    }))
}
