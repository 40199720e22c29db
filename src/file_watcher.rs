use std::path::{Path, PathBuf};

use crossbeam_channel::{Receiver, Sender};
use notify::{Event as NotifyEvent, EventKind, RecommendedWatcher, RecursiveMode, Watcher};

use crate::blueprint::{blueprint_for_path, BlueprintId};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WatchEvent {
    SourceChanged(BlueprintId),
}

/// Keeps the OS watcher alive; dropping it stops the events.
pub struct SourceWatcher {
    _watcher: RecommendedWatcher,
    events: Receiver<WatchEvent>,
}

impl SourceWatcher {
    pub fn events(&self) -> &Receiver<WatchEvent> {
        &self.events
    }
}

/// Watches `root` recursively for created or modified world-code files.
pub fn watch(root: &Path) -> Result<SourceWatcher, notify::Error> {
    let (tx, rx) = crossbeam_channel::unbounded::<WatchEvent>();
    let root_dir = canonical(root);
    let mut watcher = notify::recommended_watcher(move |res: Result<NotifyEvent, notify::Error>| {
        match res {
            Ok(event) => handle_fs_event(event, &tx, &root_dir),
            Err(err) => tracing::warn!(error = %err, "source watcher error"),
        }
    })?;
    watcher.watch(root, RecursiveMode::Recursive)?;
    tracing::info!(root = %root.display(), "watching world sources");
    Ok(SourceWatcher {
        _watcher: watcher,
        events: rx,
    })
}

fn handle_fs_event(event: NotifyEvent, tx: &Sender<WatchEvent>, root: &Path) {
    if !matches!(event.kind, EventKind::Create(_) | EventKind::Modify(_)) {
        return;
    }
    for path in &event.paths {
        if let Some(id) = blueprint_for_path(root, &canonical(path)) {
            let _ = tx.send(WatchEvent::SourceChanged(id));
        }
    }
}

fn canonical(path: &Path) -> PathBuf {
    std::fs::canonicalize(path).unwrap_or_else(|_| path.to_path_buf())
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, ModifyKind, RemoveKind};
    use std::time::{Duration, Instant};

    #[test]
    fn only_rhai_creates_and_modifies_are_forwarded() {
        let dir = tempfile::tempdir().expect("tempdir");
        let root = canonical(dir.path());
        std::fs::create_dir_all(root.join("npc")).expect("mkdir");
        let rat = root.join("npc/rat.rhai");
        let notes = root.join("npc/notes.txt");
        std::fs::write(&rat, "fn on_load() {}").expect("write");
        std::fs::write(&notes, "todo").expect("write");
        let (tx, rx) = crossbeam_channel::unbounded();

        handle_fs_event(
            NotifyEvent::new(EventKind::Modify(ModifyKind::Any)).add_path(rat.clone()),
            &tx,
            &root,
        );
        handle_fs_event(
            NotifyEvent::new(EventKind::Create(CreateKind::File)).add_path(notes),
            &tx,
            &root,
        );
        handle_fs_event(
            NotifyEvent::new(EventKind::Remove(RemoveKind::File)).add_path(rat),
            &tx,
            &root,
        );

        let events: Vec<WatchEvent> = rx.try_iter().collect();
        assert_eq!(
            events,
            vec![WatchEvent::SourceChanged(BlueprintId::from("npc/rat"))]
        );
    }

    #[test]
    fn edits_on_disk_reach_the_channel() {
        let dir = tempfile::tempdir().expect("tempdir");
        std::fs::create_dir_all(dir.path().join("room")).expect("mkdir");
        let watcher = watch(dir.path()).expect("watch");
        std::fs::write(dir.path().join("room/start.rhai"), "fn reset() {}").expect("write");

        let wanted = WatchEvent::SourceChanged(BlueprintId::from("room/start"));
        let deadline = Instant::now() + Duration::from_secs(10);
        let mut seen = false;
        while Instant::now() < deadline {
            match watcher.events().recv_timeout(Duration::from_millis(200)) {
                Ok(event) if event == wanted => {
                    seen = true;
                    break;
                }
                _ => {}
            }
        }
        assert!(seen, "no change event for room/start");
    }
}
