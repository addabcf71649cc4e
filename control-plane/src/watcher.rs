//! Config file watching.
//!
//! The parent directory is watched rather than the file itself so that
//! editors which save by delete-and-recreate or rename keep triggering
//! reloads.

use std::ffi::{OsStr, OsString};
use std::path::Path;

use anyhow::{Context, Result};
use notify::event::{AccessKind, AccessMode};
use notify::{Config as NotifyConfig, Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

/// Start watching `path`. Each relevant change sends one `()`; bursts
/// collapse into a single pending notification. Dropping the returned
/// watcher stops the stream.
pub fn watch(path: &Path) -> Result<(RecommendedWatcher, mpsc::Receiver<()>)> {
    let file_name: OsString = path
        .file_name()
        .context("Config path has no file name")?
        .to_os_string();
    let dir = parent_dir(path);

    let (tx, rx) = mpsc::channel(1);
    let mut watcher = RecommendedWatcher::new(
        move |res: notify::Result<Event>| match res {
            Ok(event) if is_config_event(&event, &file_name) => {
                debug!("Config event: {:?}", event.kind);
                let _ = tx.try_send(());
            }
            Ok(_) => {}
            Err(e) => warn!("Config watch error: {}", e),
        },
        NotifyConfig::default(),
    )?;

    watcher
        .watch(dir, RecursiveMode::NonRecursive)
        .with_context(|| format!("Failed to watch {}", dir.display()))?;
    info!("Watching config file {}", path.display());

    Ok((watcher, rx))
}

fn parent_dir(path: &Path) -> &Path {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => dir,
        _ => Path::new("."),
    }
}

/// Created, modified, renamed or closed-after-write, and naming the config
/// file.
fn is_config_event(event: &Event, file_name: &OsStr) -> bool {
    let relevant = matches!(
        event.kind,
        EventKind::Create(_)
            | EventKind::Modify(_)
            | EventKind::Access(AccessKind::Close(AccessMode::Write))
    );
    relevant
        && event
            .paths
            .iter()
            .any(|p| p.file_name() == Some(file_name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use notify::event::{CreateKind, DataChange, ModifyKind, RemoveKind, RenameMode};
    use std::path::PathBuf;

    fn event(kind: EventKind, path: &str) -> Event {
        Event::new(kind).add_path(PathBuf::from(path))
    }

    #[test]
    fn test_config_events() {
        let name = OsStr::new("config.txt");
        let modify = EventKind::Modify(ModifyKind::Data(DataChange::Content));

        assert!(is_config_event(&event(modify, "/etc/ipfilter/config.txt"), name));
        assert!(is_config_event(
            &event(EventKind::Create(CreateKind::File), "/etc/ipfilter/config.txt"),
            name
        ));
        assert!(is_config_event(
            &event(EventKind::Modify(ModifyKind::Name(RenameMode::To)), "/etc/ipfilter/config.txt"),
            name
        ));
        assert!(is_config_event(
            &event(
                EventKind::Access(AccessKind::Close(AccessMode::Write)),
                "/etc/ipfilter/config.txt"
            ),
            name
        ));
    }

    #[test]
    fn test_ignored_events() {
        let name = OsStr::new("config.txt");
        let modify = EventKind::Modify(ModifyKind::Data(DataChange::Content));

        assert!(!is_config_event(&event(modify, "/etc/ipfilter/other.txt"), name));
        assert!(!is_config_event(
            &event(EventKind::Remove(RemoveKind::File), "/etc/ipfilter/config.txt"),
            name
        ));
        assert!(!is_config_event(
            &event(
                EventKind::Access(AccessKind::Close(AccessMode::Read)),
                "/etc/ipfilter/config.txt"
            ),
            name
        ));
    }

    #[test]
    fn test_parent_dir() {
        assert_eq!(parent_dir(Path::new("config.txt")), Path::new("."));
        assert_eq!(parent_dir(Path::new("/etc/ipfilter/config.txt")), Path::new("/etc/ipfilter"));
    }
}
