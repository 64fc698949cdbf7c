//! `raya-coro config` and `raya-coro check-config`

use anyhow::Context;
use raya_coro::SchedulerConfig;
use std::path::Path;

pub fn print_default(output: Option<&Path>) -> anyhow::Result<()> {
    let rendered = SchedulerConfig::default()
        .to_toml_string()
        .context("failed to render default config")?;

    match output {
        Some(path) => {
            std::fs::write(path, rendered)
                .with_context(|| format!("failed to write {}", path.display()))?;
            println!("Wrote default config to {}", path.display());
        }
        None => print!("{}", rendered),
    }
    Ok(())
}

pub fn check(path: &Path) -> anyhow::Result<()> {
    let config = SchedulerConfig::load(path)
        .with_context(|| format!("invalid config {}", path.display()))?;
    println!(
        "{}: ok ({} workers, {:?} contexts, limit {} coroutines)",
        path.display(),
        config.effective_worker_count(),
        config.context_kind,
        config.coroutine_count_limit
    );
    Ok(())
}
