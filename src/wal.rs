use std::fs::{self, File, OpenOptions};
use std::io::{self, BufReader, BufWriter, Read, Write};
use std::path::{Path, PathBuf};

use tokio::sync::{mpsc, oneshot};

use crate::model::Event;

/// Larger length prefixes can only come from a corrupt tail.
const MAX_FRAME_LEN: usize = 64 * 1024 * 1024;

/// Encode a single event to [len][bincode][crc32] format.
fn encode_event(writer: &mut impl Write, event: &Event) -> io::Result<()> {
    let payload =
        bincode::serialize(event).map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e))?;
    let len = payload.len() as u32;
    let crc = crc32fast::hash(&payload);
    writer.write_all(&len.to_le_bytes())?;
    writer.write_all(&payload)?;
    writer.write_all(&crc.to_le_bytes())?;
    Ok(())
}

/// Read one `[len][payload][crc]` frame. `Ok(None)` on a clean or torn tail.
fn read_frame(reader: &mut impl Read) -> io::Result<Option<Vec<u8>>> {
    let mut len_buf = [0u8; 4];
    match reader.read_exact(&mut len_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    let len = u32::from_le_bytes(len_buf) as usize;
    if len > MAX_FRAME_LEN {
        return Ok(None);
    }

    let mut payload = vec![0u8; len];
    match reader.read_exact(&mut payload) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }

    let mut crc_buf = [0u8; 4];
    match reader.read_exact(&mut crc_buf) {
        Ok(()) => {}
        Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e),
    }
    if u32::from_le_bytes(crc_buf) != crc32fast::hash(&payload) {
        return Ok(None);
    }
    Ok(Some(payload))
}

/// Decode frames until the first clean, torn or corrupt tail. Returns the
/// events and the byte length of the valid prefix.
fn read_events(reader: &mut impl Read) -> io::Result<(Vec<Event>, u64)> {
    let mut events = Vec::new();
    let mut valid_len = 0u64;
    while let Some(payload) = read_frame(reader)? {
        match bincode::deserialize::<Event>(&payload) {
            Ok(event) => events.push(event),
            Err(_) => break,
        }
        valid_len += payload.len() as u64 + 8;
    }
    Ok((events, valid_len))
}

/// Append-only tenant log.
///
/// Format per entry: `[u32: len][bincode: Event][u32: crc32]`
/// - `len` is the byte length of the bincode payload (not including the CRC).
/// - A torn or corrupt tail (crash mid-write) ends replay; everything before it is kept.
pub struct Wal {
    writer: BufWriter<File>,
    path: PathBuf,
    appends_since_compact: u64,
}

impl Wal {
    /// Open (or create) the WAL file at `path`. Appends go to the end of the
    /// file as it is; use [`Wal::recover`] on a log that may have a torn tail.
    pub fn open(path: &Path) -> io::Result<Self> {
        let file = OpenOptions::new().create(true).append(true).open(path)?;
        Ok(Self {
            writer: BufWriter::new(file),
            path: path.to_path_buf(),
            appends_since_compact: 0,
        })
    }

    /// Replay `path`, cut off any torn tail, and open it for appending.
    /// New frames land directly after the last valid one.
    pub fn recover(path: &Path) -> io::Result<(Self, Vec<Event>)> {
        let events = match File::open(path) {
            Ok(file) => {
                let on_disk = file.metadata()?.len();
                let (events, valid_len) = read_events(&mut BufReader::new(file))?;
                if valid_len < on_disk {
                    let file = OpenOptions::new().write(true).open(path)?;
                    file.set_len(valid_len)?;
                    file.sync_all()?;
                }
                events
            }
            Err(e) if e.kind() == io::ErrorKind::NotFound => Vec::new(),
            Err(e) => return Err(e),
        };
        Ok((Self::open(path)?, events))
    }

    #[cfg(test)]
    pub fn append(&mut self, event: &Event) -> io::Result<()> {
        self.append_buffered(event)?;
        self.flush_sync()
    }

    /// Buffer an event; durable only after `flush_sync`.
    pub fn append_buffered(&mut self, event: &Event) -> io::Result<()> {
        encode_event(&mut self.writer, event)?;
        self.appends_since_compact += 1;
        Ok(())
    }

    /// Flush the BufWriter and fsync the underlying file.
    pub fn flush_sync(&mut self) -> io::Result<()> {
        self.writer.flush()?;
        self.writer.get_ref().sync_all()
    }

    /// Bytes on disk. Only meaningful right after `flush_sync`.
    fn flushed_len(&self) -> io::Result<u64> {
        Ok(self.writer.get_ref().metadata()?.len())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn appends_since_compact(&self) -> u64 {
        self.appends_since_compact
    }

    fn compact_path(path: &Path) -> PathBuf {
        path.with_extension("wal.tmp")
    }

    /// Write compacted events to the temp file and fsync. Slow; runs off
    /// the writer task.
    fn write_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        let mut writer = BufWriter::new(File::create(Self::compact_path(path))?);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Add events acknowledged while the temp file was being written.
    fn extend_compact_file(path: &Path, events: &[Event]) -> io::Result<()> {
        if events.is_empty() {
            return Ok(());
        }
        let file = OpenOptions::new().append(true).open(Self::compact_path(path))?;
        let mut writer = BufWriter::new(file);
        for event in events {
            encode_event(&mut writer, event)?;
        }
        writer.flush()?;
        writer.get_ref().sync_all()
    }

    /// Rename the temp file over the log and reopen it.
    fn swap_compact_file(&mut self) -> io::Result<()> {
        fs::rename(Self::compact_path(&self.path), &self.path)?;
        let file = OpenOptions::new().create(true).append(true).open(&self.path)?;
        self.writer = BufWriter::new(file);
        self.appends_since_compact = 0;
        Ok(())
    }

    /// Rewrite the log with `events` via a temp file and an atomic rename.
    #[cfg(test)]
    pub fn compact(&mut self, events: &[Event]) -> io::Result<()> {
        Self::write_compact_file(&self.path, events)?;
        self.swap_compact_file()
    }

    /// Replay the WAL from disk, returning all valid events.
    pub fn replay(path: &Path) -> io::Result<Vec<Event>> {
        Self::replay_prefix(path, u64::MAX)
    }

    /// Replay at most the first `len` bytes of the log.
    fn replay_prefix(path: &Path, len: u64) -> io::Result<Vec<Event>> {
        let file = match File::open(path) {
            Ok(f) => f,
            Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let (events, _) = read_events(&mut BufReader::new(file).take(len))?;
        Ok(events)
    }
}

// ── Group-commit writer ──────────────────────────────────

/// Folds a full event history into the minimal history with the same state.
pub type Compactor = fn(&[Event]) -> Vec<Event>;

enum WalCommand {
    Append {
        event: Event,
        response: oneshot::Sender<io::Result<()>>,
    },
    Compact {
        response: oneshot::Sender<io::Result<()>>,
    },
    AppendsSinceCompact {
        response: oneshot::Sender<u64>,
    },
}

type Batch = Vec<(Event, oneshot::Sender<io::Result<()>>)>;

/// Handle to the background task that owns the WAL file.
#[derive(Clone)]
pub struct WalWriter {
    tx: mpsc::Sender<WalCommand>,
}

impl WalWriter {
    pub fn spawn(wal: Wal, compactor: Compactor) -> Self {
        let (tx, rx) = mpsc::channel(4096);
        tokio::spawn(writer_loop(wal, rx, compactor));
        Self { tx }
    }

    /// Append and wait until the event is fsync'd.
    pub async fn append(&self, event: &Event) -> io::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(WalCommand::Append { event: event.clone(), response: tx })
            .await
            .map_err(|_| io::Error::other("WAL writer shut down"))?;
        rx.await.map_err(|_| io::Error::other("WAL writer dropped response"))?
    }

    pub async fn compact(&self) -> io::Result<()> {
        let (tx, rx) = oneshot::channel();
        self.tx
            .send(WalCommand::Compact { response: tx })
            .await
            .map_err(|_| io::Error::other("WAL writer shut down"))?;
        rx.await.map_err(|_| io::Error::other("WAL writer dropped response"))?
    }

    pub async fn appends_since_compact(&self) -> u64 {
        let (tx, rx) = oneshot::channel();
        if self.tx.send(WalCommand::AppendsSinceCompact { response: tx }).await.is_err() {
            return 0;
        }
        rx.await.unwrap_or(0)
    }
}

/// 1. Block until the first Append arrives.
/// 2. Buffer it and drain every Append already queued (the batch window).
/// 3. One fsync for the whole batch, then answer every sender.
async fn writer_loop(mut wal: Wal, mut rx: mpsc::Receiver<WalCommand>, compactor: Compactor) {
    while let Some(cmd) = rx.recv().await {
        match cmd {
            WalCommand::Append { event, response } => {
                let mut batch = vec![(event, response)];
                let deferred = drain_appends(&mut rx, &mut batch);
                commit_batch(&mut wal, batch);
                match deferred {
                    Some(WalCommand::Compact { response }) => {
                        compact(&mut wal, &mut rx, compactor, response).await
                    }
                    Some(WalCommand::AppendsSinceCompact { response }) => {
                        let _ = response.send(wal.appends_since_compact());
                    }
                    Some(WalCommand::Append { .. }) | None => {}
                }
            }
            WalCommand::Compact { response } => compact(&mut wal, &mut rx, compactor, response).await,
            WalCommand::AppendsSinceCompact { response } => {
                let _ = response.send(wal.appends_since_compact());
            }
        }
    }
}

/// Pull every Append already queued into `batch`. Returns the first
/// non-append command, if one was pulled.
fn drain_appends(rx: &mut mpsc::Receiver<WalCommand>, batch: &mut Batch) -> Option<WalCommand> {
    loop {
        match rx.try_recv() {
            Ok(WalCommand::Append { event, response }) => batch.push((event, response)),
            Ok(other) => return Some(other),
            Err(_) => return None,
        }
    }
}

/// Write and fsync a batch, answer its senders, and hand back the events
/// that are now durable.
fn commit_batch(wal: &mut Wal, batch: Batch) -> Vec<Event> {
    metrics::histogram!(crate::observability::WAL_FLUSH_BATCH_SIZE).record(batch.len() as f64);
    let flush_start = std::time::Instant::now();
    let result = flush_batch(wal, &batch);
    metrics::histogram!(crate::observability::WAL_FLUSH_DURATION_SECONDS)
        .record(flush_start.elapsed().as_secs_f64());

    let mut durable = Vec::new();
    for (event, tx) in batch {
        let r = match &result {
            Ok(()) => {
                durable.push(event);
                Ok(())
            }
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
    durable
}

fn flush_batch(wal: &mut Wal, batch: &Batch) -> io::Result<()> {
    let mut append_err = None;
    for (event, _) in batch {
        if let Err(e) = wal.append_buffered(event) {
            append_err = Some(e);
            break;
        }
    }
    // Flush even after an append error so partial bytes don't leak into the next batch.
    let flush_result = wal.flush_sync();
    match append_err {
        Some(e) => Err(e),
        None => flush_result,
    }
}

/// Compact without stalling appends.
///
/// The snapshot covers the log up to its current length and is written on
/// the blocking pool. Appends keep committing to the live log meanwhile and
/// are copied onto the temp file before the rename, so nothing acknowledged
/// is lost and nothing is written twice.
async fn compact(
    wal: &mut Wal,
    rx: &mut mpsc::Receiver<WalCommand>,
    compactor: Compactor,
    response: oneshot::Sender<io::Result<()>>,
) {
    let mut waiters = vec![response];
    let snapshot_len = match wal.flush_sync().and_then(|()| wal.flushed_len()) {
        Ok(len) => len,
        Err(e) => return answer(waiters, Err(e)),
    };
    let path = wal.path().to_path_buf();
    let mut job = tokio::task::spawn_blocking(move || {
        let events = Wal::replay_prefix(&path, snapshot_len)?;
        Wal::write_compact_file(&path, &compactor(&events))
    });

    let mut tail = Vec::new();
    let written = loop {
        tokio::select! {
            joined = &mut job => break joined.unwrap_or_else(|e| Err(io::Error::other(e))),
            Some(cmd) = rx.recv() => match cmd {
                WalCommand::Append { event, response } => {
                    let mut batch = vec![(event, response)];
                    let deferred = drain_appends(rx, &mut batch);
                    tail.extend(commit_batch(wal, batch));
                    match deferred {
                        Some(WalCommand::Compact { response }) => waiters.push(response),
                        Some(WalCommand::AppendsSinceCompact { response }) => {
                            let _ = response.send(wal.appends_since_compact());
                        }
                        Some(WalCommand::Append { .. }) | None => {}
                    }
                }
                WalCommand::Compact { response } => waiters.push(response),
                WalCommand::AppendsSinceCompact { response } => {
                    let _ = response.send(wal.appends_since_compact());
                }
            },
        }
    };

    let result = written
        .and_then(|()| Wal::extend_compact_file(wal.path(), &tail))
        .and_then(|()| wal.swap_compact_file());
    if result.is_ok() {
        wal.appends_since_compact = tail.len() as u64;
    }
    answer(waiters, result);
}

fn answer(waiters: Vec<oneshot::Sender<io::Result<()>>>, result: io::Result<()>) {
    for tx in waiters {
        let r = match &result {
            Ok(()) => Ok(()),
            Err(e) => Err(io::Error::new(e.kind(), e.to_string())),
        };
        let _ = tx.send(r);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::*;
    use ulid::Ulid;

    fn tmp_path(name: &str) -> PathBuf {
        let dir = std::env::temp_dir().join("studioslot_test_wal");
        fs::create_dir_all(&dir).unwrap();
        let path = dir.join(name);
        let _ = fs::remove_file(&path);
        path
    }

    fn studio_event() -> Event {
        Event::StudioCreated {
            studio: Studio { id: Ulid::new(), name: None, capacity: 1 },
        }
    }

    #[test]
    fn append_and_replay() {
        let path = tmp_path("append_and_replay.wal");
        let events = vec![
            studio_event(),
            Event::CoachCreated { coach: Coach { id: Ulid::new(), name: Some("Ana".into()) } },
        ];
        {
            let mut wal = Wal::open(&path).unwrap();
            for e in &events {
                wal.append(e).unwrap();
            }
        }
        assert_eq!(Wal::replay(&path).unwrap(), events);
    }

    #[test]
    fn replay_stops_at_torn_tail() {
        let path = tmp_path("torn_tail.wal");
        let event = studio_event();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[7u8; 6]).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
    }

    #[test]
    fn recover_cuts_torn_tail_before_appending() {
        let path = tmp_path("recover_torn_tail.wal");
        let first = studio_event();
        let second = studio_event();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&first).unwrap();
        }
        let clean_len = fs::metadata(&path).unwrap().len();
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&[7u8; 6]).unwrap();
        }

        // First restart: the tail goes, new writes follow the last good frame.
        {
            let (mut wal, events) = Wal::recover(&path).unwrap();
            assert_eq!(events, vec![first.clone()]);
            assert_eq!(fs::metadata(&path).unwrap().len(), clean_len);
            wal.append(&second).unwrap();
        }

        // Second restart sees both.
        let (_, events) = Wal::recover(&path).unwrap();
        assert_eq!(events, vec![first, second]);
    }

    #[test]
    fn recover_creates_missing_file() {
        let path = tmp_path("recover_missing.wal");
        let (_, events) = Wal::recover(&path).unwrap();
        assert!(events.is_empty());
        assert!(path.exists());
    }

    #[test]
    fn oversized_length_prefix_is_a_torn_tail() {
        let path = tmp_path("oversized_len.wal");
        let event = studio_event();
        {
            let mut wal = Wal::open(&path).unwrap();
            wal.append(&event).unwrap();
        }
        {
            let mut f = OpenOptions::new().append(true).open(&path).unwrap();
            f.write_all(&u32::MAX.to_le_bytes()).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![event]);
    }

    #[test]
    fn replay_nonexistent_file() {
        let path = tmp_path("nonexistent.wal");
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn replay_rejects_bad_crc() {
        let path = tmp_path("bad_crc.wal");
        {
            let payload = bincode::serialize(&studio_event()).unwrap();
            let mut f = File::create(&path).unwrap();
            f.write_all(&(payload.len() as u32).to_le_bytes()).unwrap();
            f.write_all(&payload).unwrap();
            f.write_all(&0xDEADBEEFu32.to_le_bytes()).unwrap();
        }
        assert!(Wal::replay(&path).unwrap().is_empty());
    }

    #[test]
    fn compact_then_append() {
        let path = tmp_path("compact_append.wal");
        let keep = studio_event();
        let later = studio_event();
        {
            let mut wal = Wal::open(&path).unwrap();
            for _ in 0..10 {
                wal.append(&studio_event()).unwrap();
            }
            let before = fs::metadata(&path).unwrap().len();
            wal.compact(std::slice::from_ref(&keep)).unwrap();
            assert_eq!(wal.appends_since_compact(), 0);
            assert!(fs::metadata(&path).unwrap().len() < before);
            wal.append(&later).unwrap();
        }
        assert_eq!(Wal::replay(&path).unwrap(), vec![keep, later]);
    }

    fn keep_last(events: &[Event]) -> Vec<Event> {
        events.last().cloned().into_iter().collect()
    }

    #[tokio::test]
    async fn writer_batches_and_compacts() {
        let path = tmp_path("writer.wal");
        let writer = WalWriter::spawn(Wal::open(&path).unwrap(), keep_last);

        let mut handles = Vec::new();
        for _ in 0..20 {
            let w = writer.clone();
            handles.push(tokio::spawn(async move { w.append(&studio_event()).await }));
        }
        for h in handles {
            h.await.unwrap().unwrap();
        }
        assert_eq!(writer.appends_since_compact().await, 20);
        assert_eq!(Wal::replay(&path).unwrap().len(), 20);

        writer.compact().await.unwrap();
        assert_eq!(writer.appends_since_compact().await, 0);
        assert_eq!(Wal::replay(&path).unwrap().len(), 1);
    }

    fn keep_all(events: &[Event]) -> Vec<Event> {
        events.to_vec()
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn appends_during_compaction_are_kept_once() {
        let path = tmp_path("writer_compact_race.wal");
        let writer = WalWriter::spawn(Wal::open(&path).unwrap(), keep_all);

        let mut expected = Vec::new();
        for _ in 0..50 {
            let event = studio_event();
            writer.append(&event).await.unwrap();
            expected.push(event);
        }

        let racing: Vec<Event> = (0..50).map(|_| studio_event()).collect();
        let mut handles = Vec::new();
        for event in racing.clone() {
            let w = writer.clone();
            handles.push(tokio::spawn(async move { w.append(&event).await }));
        }
        let compaction = {
            let w = writer.clone();
            tokio::spawn(async move { w.compact().await })
        };
        for h in handles {
            h.await.unwrap().unwrap();
        }
        compaction.await.unwrap().unwrap();
        expected.extend(racing);

        let mut replayed = Wal::replay(&path).unwrap();
        assert_eq!(replayed.len(), expected.len());
        let key = |e: &Event| format!("{e:?}");
        replayed.sort_by_key(key);
        expected.sort_by_key(key);
        assert_eq!(replayed, expected);

        // The reopened log still takes appends.
        writer.append(&studio_event()).await.unwrap();
        assert_eq!(Wal::replay(&path).unwrap().len(), expected.len() + 1);
    }
}
