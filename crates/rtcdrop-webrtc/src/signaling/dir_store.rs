//! Room store backed by a shared directory
//!
//! One JSON file per room under `<root>/<table>/`. Writers serialize through
//! an exclusive lock on `<table>/.lock` and replace records atomically, so
//! readers never see a half-written file. Two processes pointed at the same
//! directory (or a synced folder) can rendezvous through it.

use anyhow::{Context, Result};
use async_trait::async_trait;
use fs4::fs_std::FileExt;
use notify::{EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tempfile::NamedTempFile;
use tokio::sync::mpsc;

use rtcdrop_common::signaling::room::{
    generate_room_id, Room, RoomFields, RoomStore, RoomSubscription,
};

const LOCK_FILE: &str = ".lock";

/// Window in which bursts of file events are coalesced into one re-read
const WATCH_DEBOUNCE: Duration = Duration::from_millis(20);

/// Directory-backed [`RoomStore`].
#[derive(Debug, Clone)]
pub struct DirRoomStore {
    dir: PathBuf,
}

impl DirRoomStore {
    /// Open (creating if needed) the `table` directory under `root`.
    pub fn open(root: impl AsRef<Path>, table: &str) -> Result<Self> {
        let dir = root.as_ref().join(table);
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("Failed to create room directory {}", dir.display()))?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn room_path(&self, id: &str) -> Result<PathBuf> {
        if !is_valid_id(id) {
            anyhow::bail!("Invalid room id: {:?}", id);
        }
        Ok(self.dir.join(format!("{}.json", id)))
    }
}

/// Room ids become file names; keep them to one plain path component.
fn is_valid_id(id: &str) -> bool {
    !id.is_empty()
        && id.len() <= 64
        && id
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_')
}

/// Hold the table lock until the returned file is dropped.
fn lock_table(dir: &Path) -> Result<File> {
    let file = OpenOptions::new()
        .create(true)
        .truncate(false)
        .read(true)
        .write(true)
        .open(dir.join(LOCK_FILE))
        .context("Failed to open room table lock")?;
    file.lock_exclusive()
        .context("Failed to acquire room table lock")?;
    Ok(file)
}

fn read_room(path: &Path) -> Result<Option<Room>> {
    match std::fs::read(path) {
        Ok(bytes) => serde_json::from_slice(&bytes)
            .map(Some)
            .with_context(|| format!("Corrupt room record {}", path.display())),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e).with_context(|| format!("Failed to read {}", path.display())),
    }
}

fn write_room(path: &Path, room: &Room) -> Result<()> {
    let dir = path.parent().unwrap_or(Path::new("."));
    let mut tmp = NamedTempFile::new_in(dir).context("Failed to create temp room record")?;
    serde_json::to_writer_pretty(&mut tmp, room).context("Failed to encode room record")?;
    tmp.flush().context("Failed to write room record")?;
    tmp.persist(path)
        .map_err(|e| e.error)
        .with_context(|| format!("Failed to replace {}", path.display()))?;
    Ok(())
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .context("Room store task failed")?
}

#[async_trait]
impl RoomStore for DirRoomStore {
    async fn create(&self, fields: RoomFields) -> Result<Room> {
        let store = self.clone();
        blocking(move || {
            let _lock = lock_table(&store.dir)?;
            let (id, path) = loop {
                let id = generate_room_id();
                let path = store.room_path(&id)?;
                if !path.exists() {
                    break (id, path);
                }
            };
            let mut room = Room::new(id);
            room.apply(fields)?;
            write_room(&path, &room)?;
            log::debug!("Created room {} at {}", room.id, path.display());
            Ok(room)
        })
        .await
    }

    async fn get(&self, id: &str) -> Result<Option<Room>> {
        // A malformed code simply names no room
        let Ok(path) = self.room_path(id) else {
            return Ok(None);
        };
        blocking(move || read_room(&path)).await
    }

    async fn update(&self, id: &str, fields: RoomFields) -> Result<Room> {
        let path = self.room_path(id)?;
        let dir = self.dir.clone();
        let id = id.to_string();
        blocking(move || {
            let _lock = lock_table(&dir)?;
            let mut room = read_room(&path)?.with_context(|| format!("Room {} not found", id))?;
            room.apply(fields)?;
            write_room(&path, &room)?;
            Ok(room)
        })
        .await
    }

    async fn destroy(&self, id: &str) -> Result<()> {
        let path = self.room_path(id)?;
        let dir = self.dir.clone();
        blocking(move || {
            let _lock = lock_table(&dir)?;
            match std::fs::remove_file(&path) {
                Ok(()) => Ok(()),
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                Err(e) => Err(e).with_context(|| format!("Failed to delete {}", path.display())),
            }
        })
        .await
    }

    async fn subscribe(&self, id: &str) -> Result<RoomSubscription> {
        let path = self.room_path(id)?;
        let read_path = path.clone();
        let initial = blocking(move || read_room(&read_path))
            .await?
            .with_context(|| format!("Room {} not found", id))?;

        let (event_tx, mut event_rx) = mpsc::channel(64);
        let mut watcher = RecommendedWatcher::new(
            move |res| {
                let _ = event_tx.blocking_send(res);
            },
            notify::Config::default(),
        )
        .context("Failed to create room watcher")?;
        watcher
            .watch(&self.dir, RecursiveMode::NonRecursive)
            .context("Failed to watch room directory")?;

        let tx = RoomSubscription::channel();
        let feed = tx.clone();
        let feeder = tokio::spawn(async move {
            // Dropping the watcher stops the events
            let _watcher = watcher;
            let mut last = initial;
            while let Some(res) = event_rx.recv().await {
                if !touches(&res, &path) {
                    continue;
                }
                tokio::time::sleep(WATCH_DEBOUNCE).await;
                while event_rx.try_recv().is_ok() {}

                let read_path = path.clone();
                match blocking(move || read_room(&read_path)).await {
                    Ok(Some(room)) if room != last => {
                        last = room.clone();
                        if feed.send(room).is_err() {
                            log::debug!("Room subscription has no readers");
                        }
                    }
                    Ok(Some(_)) => {}
                    Ok(None) => log::debug!("Room {} was deleted", last.id),
                    Err(e) => log::warn!("Failed to re-read room {}: {:#}", last.id, e),
                }
            }
        });

        Ok(RoomSubscription::new(id, tx, feeder))
    }
}

fn touches(res: &notify::Result<notify::Event>, path: &Path) -> bool {
    match res {
        Ok(event) => {
            !matches!(event.kind, EventKind::Access(_))
                && event
                    .paths
                    .iter()
                    .any(|p| p.file_name() == path.file_name())
        }
        Err(e) => {
            log::warn!("Room watcher error: {}", e);
            false
        }
    }
}
