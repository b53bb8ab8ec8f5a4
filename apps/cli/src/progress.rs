//! Progress bars for foreground downloads

use anyhow::Result;
use hanash_core::HanashCore;
use hanash_types::{CoreEvent, Status};
use indicatif::{MultiProgress, ProgressBar, ProgressStyle};
use std::collections::{HashMap, HashSet};
use std::time::Duration;

/// Render progress bars for `ids` until every one reaches a terminal status.
pub async fn watch(core: &HanashCore, ids: Vec<usize>) -> Result<()> {
    let mut rx = core.subscribe();
    let multi = MultiProgress::new();
    let mut bars: HashMap<usize, ProgressBar> = HashMap::new();
    let mut waiting: HashSet<usize> = HashSet::new();

    for id in &ids {
        let item = core.get(*id).await?;
        if matches!(item.status, Status::Completed | Status::Cancelled) {
            continue;
        }
        waiting.insert(*id);

        let bar = multi.add(ProgressBar::new(item.size.max(1)));
        bar.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{msg:<24} [{bar:32.cyan/blue}] {bytes}/{total_bytes} {bytes_per_sec} eta {eta}",
                )?
                .progress_chars("█▓▒░  "),
        );
        bar.set_message(item.name.clone());
        bar.set_position(item.downloaded);
        bars.insert(*id, bar);
    }

    // the registry poll catches downloads that finished before an event
    // made it through the subscription
    let mut ticker = tokio::time::interval(Duration::from_millis(500));
    while !waiting.is_empty() {
        tokio::select! {
            event = rx.recv() => match event {
                Ok(CoreEvent::Progress { id, downloaded, total, .. }) => {
                    if let Some(bar) = bars.get(&id) {
                        if total > 0 {
                            bar.set_length(total);
                        }
                        bar.set_position(downloaded);
                    }
                }
                Ok(CoreEvent::StatusChanged { id, status }) => {
                    settle(&mut waiting, &bars, id, status);
                }
                Ok(_) => {}
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(_) => break,
            },
            _ = ticker.tick() => {
                let pending: Vec<usize> = waiting.iter().copied().collect();
                for id in pending {
                    if let Ok(item) = core.get(id).await {
                        settle(&mut waiting, &bars, id, item.status);
                    }
                }
            }
        }
    }

    Ok(())
}

fn settle(
    waiting: &mut HashSet<usize>,
    bars: &HashMap<usize, ProgressBar>,
    id: usize,
    status: Status,
) {
    match status {
        Status::Completed => {
            if let Some(bar) = bars.get(&id) {
                bar.finish();
            }
            waiting.remove(&id);
        }
        Status::Cancelled => {
            if let Some(bar) = bars.get(&id) {
                bar.abandon();
            }
            waiting.remove(&id);
        }
        _ => {}
    }
}
