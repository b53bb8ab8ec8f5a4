//! CLI command implementations

use crate::output::{format_bytes, format_progress, format_speed};
use crate::progress;
use anyhow::Result;
use console::style;
use hanash_core::HanashCore;
use hanash_types::Status;
use std::path::PathBuf;

pub async fn probe(core: &HanashCore, url: &str) -> Result<()> {
    let info = core.probe(url).await?;

    println!("{} {}", style("name:").dim(), info.name);
    println!("{} {}", style("size:").dim(), format_bytes(info.size));
    println!(
        "{} {}",
        style("type:").dim(),
        if info.mime_type.is_empty() { "---" } else { info.mime_type.as_str() }
    );
    println!(
        "{} {}",
        style("resumable:").dim(),
        if info.resumable { "yes" } else { "no" }
    );
    println!("{} {}", style("status:").dim(), info.status);
    if hanash_core::is_bad_status(info.status) {
        println!(
            "{} the server refuses this URL, download disabled",
            style("!").red().bold()
        );
    }
    Ok(())
}

pub async fn add(
    core: &HanashCore,
    url: &str,
    folder: Option<PathBuf>,
    overwrite: bool,
    no_start: bool,
) -> Result<()> {
    let item = core.add(url, folder).await?;
    println!(
        "{} added {} (id {}, {})",
        style("✓").green().bold(),
        style(&item.name).cyan(),
        item.id,
        format_bytes(item.size)
    );

    if no_start {
        return Ok(());
    }
    core.start(item.id, overwrite).await?;
    progress::watch(core, vec![item.id]).await
}

pub async fn list(core: &HanashCore) -> Result<()> {
    let items = core.snapshot().await;
    if items.is_empty() {
        println!("no downloads");
        return Ok(());
    }

    println!(
        "{:>4}  {:<32} {:>10} {:>8} {:>12}  {}",
        style("id").bold(),
        style("name").bold(),
        style("size").bold(),
        style("done").bold(),
        style("speed").bold(),
        style("status").bold()
    );
    for item in items {
        println!(
            "{:>4}  {:<32} {:>10} {:>8} {:>12}  {}",
            item.id,
            truncate(&item.name, 32),
            format_bytes(item.size),
            format_progress(item.size, item.progress),
            format_speed(item.speed),
            item.status
        );
    }
    Ok(())
}

pub async fn pause(core: &HanashCore, id: usize) -> Result<()> {
    core.pause(id).await?;
    println!("paused {}", id);
    Ok(())
}

pub async fn resume(core: &HanashCore, id: usize) -> Result<()> {
    core.resume(id).await?;
    let item = core.get(id).await?;
    if matches!(item.status, Status::Downloading | Status::Pending) {
        progress::watch(core, vec![id]).await?;
    } else {
        println!("nothing to resume for {} ({})", id, item.status);
    }
    Ok(())
}

pub async fn cancel(core: &HanashCore, id: usize) -> Result<()> {
    core.cancel(id).await?;
    println!("cancelled {}", id);
    Ok(())
}

pub async fn delete(core: &HanashCore, id: usize) -> Result<()> {
    let removed = core.delete(id).await?;
    println!(
        "{} deleted {} and its temp files",
        style("✓").green().bold(),
        removed.name
    );
    Ok(())
}

pub async fn resume_all(core: &HanashCore) -> Result<()> {
    core.resume_all().await;
    let ids: Vec<usize> = core
        .snapshot()
        .await
        .into_iter()
        .filter(|d| matches!(d.status, Status::Downloading | Status::Pending))
        .map(|d| d.id)
        .collect();
    if ids.is_empty() {
        println!("nothing to resume");
        return Ok(());
    }
    progress::watch(core, ids).await
}

pub async fn stop_all(core: &HanashCore) -> Result<()> {
    core.stop_all().await;
    println!("stopped all downloads");
    Ok(())
}

pub async fn limit(core: &HanashCore, kb_per_sec: u64) -> Result<()> {
    core.set_speed_limit(kb_per_sec).await?;
    if kb_per_sec == 0 {
        println!("speed limit disabled");
    } else {
        println!("speed limit set to {} KB/s", kb_per_sec);
    }
    Ok(())
}

fn truncate(name: &str, width: usize) -> String {
    if name.chars().count() <= width {
        name.to_string()
    } else {
        let cut: String = name.chars().take(width.saturating_sub(3)).collect();
        format!("{cut}...")
    }
}
